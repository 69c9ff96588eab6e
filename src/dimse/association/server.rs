use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::config::CalledAeConfig;
use crate::registry::RegistrySnapshot;
use crate::types::{AE, SourceId, UI};
use dicom::dictionary_std::uids;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::server::AccessControl;
use dicom::ul::pdu::AssociationRJServiceUserReason;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextResult;
use dicom::ul::pdu::UserIdentity;
use std::convert::identity;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The peer admitted by [`PolicyGate`] during association negotiation.
#[derive(Debug, Clone)]
pub struct AcceptedPeer {
	pub calling: AE,
	pub called: AE,
	pub source: SourceId,
	pub config: Arc<CalledAeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRejection {
	CallingNotRecognized,
	CalledNotRecognized,
	SourceNotAllowed,
	Overloaded,
}

#[derive(Debug, Default)]
struct GateState {
	accepted: Option<AcceptedPeer>,
	rejected: Option<PolicyRejection>,
}

/// AE policy enforced during A-ASSOCIATE negotiation.
///
/// Unknown calling AEs, unknown called AEs and disallowed sources are
/// answered with A-ASSOCIATE-RJ before any staging resources exist. The
/// admitted peer is recorded so the handler can pick up the resolved
/// called-AE policy after the handshake.
#[derive(Clone)]
pub struct PolicyGate {
	registry: Arc<RegistrySnapshot>,
	/// Refuse the association regardless of AE policy, e.g. while the
	/// staging store is above its high-water mark.
	refuse_transient: bool,
	state: Arc<Mutex<GateState>>,
}

impl PolicyGate {
	pub fn new(registry: Arc<RegistrySnapshot>, refuse_transient: bool) -> Self {
		Self {
			registry,
			refuse_transient,
			state: Arc::new(Mutex::new(GateState::default())),
		}
	}

	pub fn accepted(&self) -> Option<AcceptedPeer> {
		self.state.lock().expect("gate lock poisoned").accepted.clone()
	}

	pub fn rejection(&self) -> Option<PolicyRejection> {
		self.state.lock().expect("gate lock poisoned").rejected
	}

	fn reject(&self, rejection: PolicyRejection) -> AssociationRJServiceUserReason {
		self.state.lock().expect("gate lock poisoned").rejected = Some(rejection);
		match rejection {
			PolicyRejection::CallingNotRecognized | PolicyRejection::SourceNotAllowed => {
				AssociationRJServiceUserReason::CallingAETitleNotRecognized
			}
			PolicyRejection::CalledNotRecognized => {
				AssociationRJServiceUserReason::CalledAETitleNotRecognized
			}
			PolicyRejection::Overloaded => AssociationRJServiceUserReason::NoReasonGiven,
		}
	}

	/// Policy check detached from the wire protocol, also exercised by unit
	/// tests without a TCP peer.
	pub fn evaluate(&self, calling: &str, called: &str) -> Result<AcceptedPeer, PolicyRejection> {
		if self.refuse_transient {
			return Err(PolicyRejection::Overloaded);
		}
		let Some(source) = self.registry.resolve_calling(calling) else {
			return Err(PolicyRejection::CallingNotRecognized);
		};
		let Some(config) = self.registry.resolve_called(called) else {
			return Err(PolicyRejection::CalledNotRecognized);
		};
		if !self.registry.source_allowed(source, &config) {
			return Err(PolicyRejection::SourceNotAllowed);
		}
		Ok(AcceptedPeer {
			calling: AE::from(calling),
			called: AE::from(called),
			source: source.clone(),
			config,
		})
	}
}

impl AccessControl for PolicyGate {
	fn check_access(
		&self,
		_this_ae_title: &str,
		calling_ae_title: &str,
		called_ae_title: &str,
		_user_identity: Option<&UserIdentity>,
	) -> Result<(), AssociationRJServiceUserReason> {
		match self.evaluate(calling_ae_title, called_ae_title) {
			Ok(peer) => {
				self.state.lock().expect("gate lock poisoned").accepted = Some(peer);
				Ok(())
			}
			Err(rejection) => Err(self.reject(rejection)),
		}
	}
}

#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextResult>,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	pub aet: AE,
	pub tcp_stream: TcpStream,
	/// Offer only codec-free transfer syntaxes.
	pub uncompressed: bool,
	/// Storage SOP classes to accept. Empty accepts any abstract syntax
	/// the peer proposes.
	pub abstract_syntaxes: Vec<UI>,
	pub policy: PolicyGate,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let policy = options.policy.clone();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.ae_access_control(options.policy);

		if options.abstract_syntaxes.is_empty() {
			server_options = server_options.promiscuous(true);
		} else {
			server_options = server_options.with_abstract_syntax(uids::VERIFICATION);
			for sop in &options.abstract_syntaxes {
				server_options = server_options.with_abstract_syntax(sop.clone());
			}
		}

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						info!(
							calling_aet = association.client_ae_title(),
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");

						connect_tx.send(Ok((stream, pcs))).map_err(|_value| ())?;
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result = association
								.send(&pdu)
								.map_err(AssociationError::Association);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::server::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							warn!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let established = connect_result.await.expect("connect_result.await");
		let (tcp_stream, presentation_contexts) = match established {
			Ok(ok) => ok,
			// Policy rejections surface as protocol errors from establish;
			// report them as such so the listener can log them as expected
			// events rather than failures.
			Err(err) if policy.rejection().is_some() => {
				debug!("Association rejected during negotiation: {err}");
				return Err(AssociationError::Rejected);
			}
			Err(err) => return Err(err),
		};

		Ok(Self {
			channel: tx,
			presentation_contexts,
			tcp_stream,
		})
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextResult] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{GroupingKind, SourceConfig};
	use crate::registry::AeRegistry;

	fn registry() -> Arc<RegistrySnapshot> {
		let sources = [
			SourceConfig {
				aet: AE::from("PACS1"),
				id: SourceId::from("src1"),
			},
			SourceConfig {
				aet: AE::from("PACS2"),
				id: SourceId::from("src2"),
			},
		];
		let aets = [CalledAeConfig {
			aet: AE::from("BRIDGE1"),
			grouping: GroupingKind::StudyInstanceUid,
			timeout: 5_000,
			max_age: 60_000,
			allowed_sops: Vec::new(),
			allowed_sources: vec![SourceId::from("src1")],
			pipelines: vec![String::from("pipeline-1")],
			priority: 128,
		}];
		AeRegistry::new(&sources, &aets).unwrap().snapshot()
	}

	#[test]
	fn unknown_calling_ae_is_rejected() {
		let gate = PolicyGate::new(registry(), false);
		let result = gate.check_access("BRIDGE1", "UNKNOWN", "BRIDGE1");
		assert_eq!(
			result,
			Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
		);
		assert_eq!(gate.rejection(), Some(PolicyRejection::CallingNotRecognized));
		assert!(gate.accepted().is_none());
	}

	#[test]
	fn unknown_called_ae_is_rejected() {
		let gate = PolicyGate::new(registry(), false);
		let result = gate.check_access("BRIDGE1", "PACS1", "UNKNOWN");
		assert_eq!(
			result,
			Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
		);
		assert_eq!(gate.rejection(), Some(PolicyRejection::CalledNotRecognized));
	}

	#[test]
	fn disallowed_source_is_rejected() {
		let gate = PolicyGate::new(registry(), false);
		let result = gate.check_access("BRIDGE1", "PACS2", "BRIDGE1");
		assert_eq!(
			result,
			Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
		);
		assert_eq!(gate.rejection(), Some(PolicyRejection::SourceNotAllowed));
	}

	#[test]
	fn admitted_peer_carries_called_ae_policy() {
		let gate = PolicyGate::new(registry(), false);
		assert!(gate.check_access("BRIDGE1", "PACS1", "BRIDGE1").is_ok());

		let peer = gate.accepted().unwrap();
		assert_eq!(peer.source, "src1");
		assert_eq!(peer.config.aet, "BRIDGE1");
	}

	#[test]
	fn overloaded_gate_refuses_valid_peers() {
		let gate = PolicyGate::new(registry(), true);
		let result = gate.check_access("BRIDGE1", "PACS1", "BRIDGE1");
		assert_eq!(result, Err(AssociationRJServiceUserReason::NoReasonGiven));
		assert_eq!(gate.rejection(), Some(PolicyRejection::Overloaded));
	}
}
