use crate::dimse::{DicomMessage, DATA_SET_MISSING};
use crate::types::{AE, US};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

/// Remote DIMSE endpoint addressed by one retrieval resource.
#[derive(Debug, Clone)]
pub struct RemoteNode {
	pub address: SocketAddr,
	pub calling_aet: AE,
	pub called_aet: AE,
}

#[derive(Debug, Error)]
pub enum OutboundError {
	#[error("Failed to establish association with '{called_aet}': {source}")]
	Connect {
		called_aet: AE,
		#[source]
		source: dicom::ul::association::client::Error,
	},
	#[error("No presentation context was accepted for '{abstract_syntax}'")]
	NoPresentationContext { abstract_syntax: String },
	#[error("Association I/O failed: {0}")]
	Transport(dicom::ul::association::client::Error),
	#[error("Failed to encode DIMSE message: {0}")]
	Encode(#[from] dicom::object::WriteError),
	#[error("Failed to decode DIMSE message: {0}")]
	Decode(#[from] dicom::object::ReadError),
	#[error("Unknown transfer syntax '{0}'")]
	UnknownTransferSyntax(String),
	#[error("Received an unexpected PDU")]
	UnexpectedPdu,
}

/// One outbound association serving a single query or retrieve operation.
///
/// The retrieval client opens an association per C-FIND/C-MOVE, drives the
/// exchange to its final status and releases; there is no connection reuse
/// to manage. Exactly one presentation context is negotiated (the
/// operation's SOP class, implicit VR little endian), so responses need no
/// per-context routing. All methods block and are expected to run on a
/// worker thread.
pub struct OutboundAssociation {
	association: dicom::ul::ClientAssociation<std::net::TcpStream>,
	presentation_context_id: u8,
	transfer_syntax: String,
}

impl OutboundAssociation {
	pub fn establish(node: &RemoteNode, abstract_syntax: &str) -> Result<Self, OutboundError> {
		let association = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(node.calling_aet.clone())
			.called_ae_title(node.called_aet.clone())
			.with_presentation_context(
				abstract_syntax.to_string(),
				vec![String::from(IMPLICIT_VR_LITTLE_ENDIAN.uid())],
			)
			.establish(node.address)
			.map_err(|source| OutboundError::Connect {
				called_aet: node.called_aet.clone(),
				source,
			})?;

		let (presentation_context_id, transfer_syntax) = {
			let pctx = association.presentation_contexts().first().ok_or_else(|| {
				OutboundError::NoPresentationContext {
					abstract_syntax: String::from(abstract_syntax),
				}
			})?;
			(pctx.id, pctx.transfer_syntax.clone())
		};

		debug!(
			called_aet = node.called_aet,
			presentation_context_id, "Established outbound association"
		);

		Ok(Self {
			association,
			presentation_context_id,
			transfer_syntax,
		})
	}

	/// Sends one DIMSE message on the negotiated context. Query identifiers
	/// are small, so no PDU chunking is needed on this path.
	pub fn send(&mut self, message: impl Into<DicomMessage>) -> Result<(), OutboundError> {
		let message: DicomMessage = message.into();

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		self.association
			.send(&Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Command,
					presentation_context_id: self.presentation_context_id,
					is_last: true,
					data: command_buf,
				}],
			})
			.map_err(OutboundError::Transport)?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&self.transfer_syntax)
				.ok_or_else(|| {
					OutboundError::UnknownTransferSyntax(self.transfer_syntax.clone())
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;
			self.association
				.send(&Pdu::PData {
					data: vec![PDataValue {
						value_type: PDataValueType::Data,
						presentation_context_id: self.presentation_context_id,
						is_last: true,
						data: data_buf,
					}],
				})
				.map_err(OutboundError::Transport)?;
		}

		Ok(())
	}

	/// Reads PDUs until one full response message is assembled. Command
	/// fragments are implicit VR little endian per the standard; a data set
	/// uses the negotiated transfer syntax.
	pub fn read(&mut self) -> Result<DicomMessage, OutboundError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self
				.association
				.receive()
				.map_err(OutboundError::Transport)?;
			let Pdu::PData { data } = pdu else {
				return Err(OutboundError::UnexpectedPdu);
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let set = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = set
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);
							if has_data_set {
								command = Some(set);
							} else {
								return Ok(DicomMessage {
									command: set,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
					PDataValueType::Data => {
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let Some(command) = command.take() else {
								// Data before the command set completed.
								return Err(OutboundError::UnexpectedPdu);
							};
							let transfer_syntax = TransferSyntaxRegistry
								.get(&self.transfer_syntax)
								.ok_or_else(|| {
									OutboundError::UnknownTransferSyntax(
										self.transfer_syntax.clone(),
									)
								})?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;
							return Ok(DicomMessage {
								command,
								data: Some(data),
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
			}
		}
	}

	/// Graceful A-RELEASE. Failures only matter to the peer; the operation
	/// result is already known by the time this runs.
	pub fn release(self) {
		if let Err(err) = self.association.release() {
			debug!("A-RELEASE failed: {err}");
		}
	}
}
