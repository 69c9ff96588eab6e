use crate::dimse::association::outbound::{OutboundAssociation, OutboundError, RemoteNode};
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse};
use crate::dimse::{next_message_id, ReadError, StatusType};
use crate::types::{Priority, QueryInformationModel, UI, US};
use dicom::object::InMemDicomObject;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

pub struct FindServiceClassUser {
	node: RemoteNode,
	timeout: Duration,
}

pub struct FindServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub priority: Priority,
}

impl FindServiceClassUser {
	pub const fn new(node: RemoteNode, timeout: Duration) -> Self {
		Self { node, timeout }
	}

	/// Runs one C-FIND query to completion and collects every matching
	/// identifier. The blocking exchange owns its association for the
	/// duration of the query and releases it afterwards.
	#[instrument(skip_all, name = "FIND-SCU")]
	pub async fn invoke(
		&self,
		options: FindServiceClassUserOptions,
	) -> Result<Vec<InMemDicomObject>, FindError> {
		let node = self.node.clone();
		let sop_class = options.query_information_model.as_find_sop_class();
		let request = CompositeFindRequest {
			identifier: options.identifier,
			message_id: next_message_id(),
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(sop_class),
		};

		let exchange =
			tokio::task::spawn_blocking(move || -> Result<Vec<InMemDicomObject>, FindError> {
				let mut association = OutboundAssociation::establish(&node, sop_class)?;
				association.send(request)?;
				trace!("Sent C-FIND-RQ");

				let mut matches = Vec::new();
				loop {
					let response = CompositeFindResponse::try_from(association.read()?)?;
					trace!("Received C-FIND-RSP");

					if let Some(data) = response.data {
						matches.push(data);
					}

					let status_type =
						StatusType::try_from(response.status).unwrap_or(StatusType::Failure);
					if status_type != StatusType::Pending {
						break;
					}
				}

				association.release();
				Ok(matches)
			});

		tokio::time::timeout(self.timeout, exchange)
			.await
			.map_err(|_| FindError::Timeout)?
			.map_err(FindError::Worker)?
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Outbound(#[from] OutboundError),
	#[error(transparent)]
	Message(#[from] ReadError),
	#[error("C-FIND timed out")]
	Timeout,
	#[error("C-FIND worker failed: {0}")]
	Worker(tokio::task::JoinError),
}
