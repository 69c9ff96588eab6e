use crate::config::ScpConfig;
use crate::dimse::association::server::{
	AcceptedPeer, PolicyGate, ServerAssociation, ServerAssociationOptions,
};
use crate::dimse::association::{Association, AssociationError, ChannelError};
use crate::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::dimse::cstore::{
	CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, STATUS_OUT_OF_RESOURCES,
	STATUS_SOP_CLASS_NOT_SUPPORTED, STATUS_SUCCESS,
};
use crate::dimse::cmove::RetrieveRouter;
use crate::dimse::{DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError};
use crate::ingest::{Instance, InstanceEvent, InstanceNotifier};
use crate::registry::AeRegistry;
use crate::storage::{StagingHandle, StagingStore};
use crate::types::US;
use anyhow::Context;
use chrono::Utc;
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::ul::pdu::{AbortRQSource, Pdu};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Consecutive store failures within one association before it is aborted.
const MAX_STORE_FAILURES: u32 = 3;

/// The ingest C-STORE SCP.
///
/// Accepts associations from configured sources, writes received objects
/// into a per-association staging scope and publishes an [`InstanceEvent`]
/// for each before acknowledging the store. Instances that are C-MOVE
/// sub-operations of an in-flight retrieval are claimed by the
/// [`RetrieveRouter`] instead and bypass the grouping path.
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	registry: Arc<AeRegistry>,
	staging: Arc<StagingStore>,
	notifier: Arc<InstanceNotifier>,
	router: RetrieveRouter,
	config: ScpConfig,
	associations: Arc<Semaphore>,
}

impl StoreServiceClassProvider {
	pub fn new(
		registry: Arc<AeRegistry>,
		staging: Arc<StagingStore>,
		notifier: Arc<InstanceNotifier>,
		router: RetrieveRouter,
		config: ScpConfig,
	) -> Self {
		let associations = Arc::new(Semaphore::new(config.max_associations));
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				registry,
				staging,
				notifier,
				router,
				config,
				associations,
			}),
		}
	}

	#[instrument(skip_all, name = "STORE-SCP")]
	pub async fn spawn(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!(aet = self.inner.config.aet, "Started Store Service Class Provider on {address}");

		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						debug!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&self.inner);
						tokio::spawn(async move {
							if let Err(err) = Self::process(stream, inner).await {
								error!("Association ended with error: {err:#}");
							}
						});
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				}
			}
		}

		info!("Store Service Class Provider stopped");
		Ok(())
	}

	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		// Hold the permit for the lifetime of the association; when the
		// semaphore is exhausted the handshake is answered with a
		// rejection instead of queueing the peer.
		let permit = inner.associations.clone().try_acquire_owned();
		let refuse_transient = permit.is_err() || inner.staging.check_pressure().is_err();
		if refuse_transient {
			warn!("Refusing association: at capacity or staging above high-water mark");
		}

		let tcp_stream = stream.into_std()?;
		// The dicom-ul crate does not use non-blocking reads/writes. The
		// actual reading/writing happens in ServerAssociation, which moves
		// socket I/O to a dedicated thread.
		tcp_stream.set_nonblocking(false)?;

		let snapshot = inner.registry.snapshot();
		let gate = PolicyGate::new(Arc::clone(&snapshot), refuse_transient);
		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
			abstract_syntaxes: snapshot.accepted_abstract_syntaxes(),
			policy: gate.clone(),
		};

		let association = match ServerAssociation::new(options).await {
			Ok(association) => association,
			Err(AssociationError::Rejected) => {
				// Policy rejections are expected operation, not failures.
				// No staging scope exists at this point.
				info!(rejection = ?gate.rejection(), "Rejected association");
				return Ok(());
			}
			Err(err) => return Err(err.into()),
		};

		let peer = gate
			.accepted()
			.context("Association established without an admitted peer")?;

		let scope = format!("assoc-{}", Uuid::new_v4());
		let staging = inner.staging.acquire(&scope)?;
		info!(
			calling_aet = peer.calling,
			called_aet = peer.called,
			scope,
			"Serving association"
		);

		let result = Self::serve(&association, &inner, &peer, &staging).await;

		inner.staging.release(&staging);
		drop(permit);
		result
	}

	/// DIMSE loop of one established association.
	async fn serve(
		association: &ServerAssociation,
		inner: &InnerStoreServiceClassProvider,
		peer: &AcceptedPeer,
		staging: &StagingHandle,
	) -> anyhow::Result<()> {
		let mut store_failures = 0u32;

		loop {
			let message = match association.read_message(inner.config.idle_timeout()).await {
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					debug!("Received A-RELEASE-RQ");
					let _ = association
						.send(Pdu::ReleaseRP, inner.config.dimse_timeout())
						.await;
					return Ok(());
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { source })) => {
					debug!("Association aborted by peer: {source:?}");
					return Ok(());
				}
				Err(ReadError::Association(AssociationError::Channel(
					ChannelError::Timeout,
				))) => {
					warn!("Association idle timeout expired, aborting");
					let _ = association
						.send(
							Pdu::AbortRQ {
								source: AbortRQSource::ServiceUser,
							},
							inner.config.dimse_timeout(),
						)
						.await;
					return Ok(());
				}
				Err(err) => return Err(err.into()),
			};

			match message.command_field() {
				Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
					let response = CompositeEchoResponse {
						message_id: message.message_id().unwrap_or(0),
						status: STATUS_SUCCESS,
					};
					association
						.write_message(
							response,
							message.presentation_context_id,
							inner.config.dimse_timeout(),
						)
						.await?;
				}
				Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
					let stored =
						Self::handle_store(association, inner, peer, staging, message).await?;
					if !stored {
						store_failures += 1;
						if store_failures >= MAX_STORE_FAILURES {
							warn!("Too many store failures, aborting association");
							let _ = association
								.send(
									Pdu::AbortRQ {
										source: AbortRQSource::ServiceUser,
									},
									inner.config.dimse_timeout(),
								)
								.await;
							return Ok(());
						}
					}
				}
				other => {
					anyhow::bail!("Unexpected Command Field {other:?}; only C-ECHO-RQ and C-STORE-RQ are supported")
				}
			}
		}
	}

	/// Handles one C-STORE-RQ. Returns whether the object was stored.
	async fn handle_store(
		association: &ServerAssociation,
		inner: &InnerStoreServiceClassProvider,
		peer: &AcceptedPeer,
		staging: &StagingHandle,
		message: DicomMessage,
	) -> anyhow::Result<bool> {
		let presentation_context_id = message.presentation_context_id;
		let pctx = match presentation_context_id {
			Some(id) => association
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.id == id),
			None => association.presentation_contexts().first(),
		}
		.context("No presentation context available")?;
		let transfer_syntax = pctx.transfer_syntax.clone();

		let message_id = message.message_id().unwrap_or(0);
		let sop_class_uid = message
			.str_attribute(tags::AFFECTED_SOP_CLASS_UID)
			.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?;
		let sop_instance_uid = message
			.str_attribute(tags::AFFECTED_SOP_INSTANCE_UID)
			.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?;

		let respond = |status: US| CompositeStoreResponse {
			message_id,
			sop_class_uid: sop_class_uid.clone(),
			sop_instance_uid: sop_instance_uid.clone(),
			status,
		};

		if !peer.config.allowed_sops.is_empty()
			&& !peer.config.allowed_sops.contains(&sop_class_uid)
		{
			warn!(
				sop_class_uid,
				called_aet = peer.called,
				"Refusing SOP class not allowed for this AE"
			);
			association
				.write_message(
					respond(STATUS_SOP_CLASS_NOT_SUPPORTED),
					presentation_context_id,
					inner.config.dimse_timeout(),
				)
				.await?;
			return Ok(false);
		}

		let originator_aet =
			message.str_attribute(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE);
		let originator_message_id =
			message.int_attribute(tags::MOVE_ORIGINATOR_MESSAGE_ID);

		let data = message
			.data
			.context("C-STORE-RQ without a data set")?;

		debug!("Received instance {sop_instance_uid} ({sop_class_uid})");

		// Sub-operations of an in-flight C-MOVE belong to a retrieval, not
		// to the ingest/grouping path.
		if let Some(sink) = inner.router.resolve(
			&peer.calling,
			originator_aet.as_deref(),
			originator_message_id,
		) {
			let target = sink.dir.join(format!("{sop_instance_uid}.dcm"));
			match Self::write_object(
				data,
				&sop_class_uid,
				&sop_instance_uid,
				&transfer_syntax,
				&target,
			)
			.await
			{
				Ok(_) => {
					let _ = sink.deposited.send(sop_instance_uid.clone()).await;
					association
						.write_message(
							respond(STATUS_SUCCESS),
							presentation_context_id,
							inner.config.dimse_timeout(),
						)
						.await?;
					return Ok(true);
				}
				Err(err) => {
					error!("Failed to write retrieved instance: {err}");
					association
						.write_message(
							respond(STATUS_OUT_OF_RESOURCES),
							presentation_context_id,
							inner.config.dimse_timeout(),
						)
						.await?;
					return Ok(false);
				}
			}
		}

		let study_instance_uid = element_str(&data, tags::STUDY_INSTANCE_UID);
		let series_instance_uid = element_str(&data, tags::SERIES_INSTANCE_UID);
		let patient_id = element_str(&data, tags::PATIENT_ID);

		let file_path = staging.file_path(&format!("{sop_instance_uid}.dcm"));
		let written = Self::write_object(
			data,
			&sop_class_uid,
			&sop_instance_uid,
			&transfer_syntax,
			&file_path,
		)
		.await;

		let bytes = match written {
			Ok(bytes) => bytes,
			Err(err) => {
				error!("Failed to write instance to staging: {err}");
				association
					.write_message(
						respond(STATUS_OUT_OF_RESOURCES),
						presentation_context_id,
						inner.config.dimse_timeout(),
					)
					.await?;
				return Ok(false);
			}
		};
		inner.staging.record_usage(bytes);

		let instance = Instance {
			sop_instance_uid: sop_instance_uid.clone(),
			series_instance_uid,
			study_instance_uid,
			patient_id,
			called_ae: peer.called.clone(),
			calling_ae: peer.calling.clone(),
			received_at: Utc::now(),
			file_path,
			transfer_syntax,
		};

		// Publish before acknowledging so a downstream observer never
		// learns about an instance later than the sending peer does.
		inner
			.notifier
			.publish(InstanceEvent {
				instance: Arc::new(instance),
				config: Arc::clone(&peer.config),
			})
			.await;

		association
			.write_message(
				respond(STATUS_SUCCESS),
				presentation_context_id,
				inner.config.dimse_timeout(),
			)
			.await?;

		Ok(true)
	}

	/// Writes the dataset as a DICOM file, returning its size in bytes.
	async fn write_object(
		data: InMemDicomObject,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		transfer_syntax: &str,
		target: &Path,
	) -> anyhow::Result<u64> {
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid)
			.media_storage_sop_instance_uid(sop_instance_uid)
			.transfer_syntax(transfer_syntax)
			.build()
			.context("FileMetaTableBuilder should contain required data")?;
		let file = data.with_exact_meta(meta);

		let target = target.to_path_buf();
		tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
			file.write_to_file(&target)?;
			Ok(std::fs::metadata(&target)?.len())
		})
		.await?
	}
}

fn element_str(data: &InMemDicomObject, tag: dicom::object::Tag) -> String {
	data.element(tag)
		.ok()
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim().to_string())
		.unwrap_or_default()
}
