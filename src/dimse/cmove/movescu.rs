use crate::dimse::association::outbound::{OutboundAssociation, OutboundError, RemoteNode};
use crate::dimse::cmove::CompositeMoveRequest;
use crate::dimse::StatusType;
use dicom::dictionary_std::{tags, uids};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, trace};

pub struct MoveServiceClassUser {
	node: RemoteNode,
	timeout: Duration,
}

impl MoveServiceClassUser {
	pub const fn new(node: RemoteNode, timeout: Duration) -> Self {
		Self { node, timeout }
	}

	/// Drives one C-MOVE operation to completion. Returns once the remote
	/// node reports the final status; by then every sub-operation has been
	/// delivered to the move destination and claimed by the retrieve
	/// router.
	#[instrument(skip_all, name = "MOVE-SCU")]
	pub async fn invoke(&self, request: CompositeMoveRequest) -> Result<(), MoveError> {
		let node = self.node.clone();

		let exchange = tokio::task::spawn_blocking(move || -> Result<(), MoveError> {
			let mut association = OutboundAssociation::establish(
				&node,
				uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
			)?;
			association.send(request)?;
			trace!("Sent C-MOVE-RQ");

			loop {
				let response = association.read()?;
				trace!("Received C-MOVE-RSP");

				let status_type = response
					.int_attribute(tags::STATUS)
					.and_then(|value| StatusType::try_from(value).ok())
					.unwrap_or(StatusType::Failure);

				match status_type {
					StatusType::Success => {
						info!("C-MOVE completed successfully");
						break;
					}
					StatusType::Pending => {
						trace!("C-MOVE is pending");
					}
					StatusType::Cancel => return Err(MoveError::Cancelled),
					StatusType::Failure | StatusType::Warning => {
						error!("C-MOVE sub-operation failed");
						return Err(MoveError::OperationFailed);
					}
				}
			}

			association.release();
			Ok(())
		});

		tokio::time::timeout(self.timeout, exchange)
			.await
			.map_err(|_| MoveError::Timeout)?
			.map_err(MoveError::Worker)?
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Outbound(#[from] OutboundError),
	#[error("Sub-operation failed")]
	OperationFailed,
	#[error("C-MOVE operation was canceled")]
	Cancelled,
	#[error("C-MOVE timed out")]
	Timeout,
	#[error("C-MOVE worker failed: {0}")]
	Worker(tokio::task::JoinError),
}
