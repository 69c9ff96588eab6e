//! Outbound DICOM retrieval for inference requests.
//!
//! A [`Retriever`] deposits the instances selected by a request's metadata
//! into a target directory and reports what arrived. The DIMSE path drives
//! C-FIND and C-MOVE; the DICOMweb path drives QIDO-RS and WADO-RS.

mod dimse;
mod web;

pub use dimse::DimseRetriever;
pub use web::DicomWebRetriever;

use crate::dimse::cfind::findscu::FindError;
use crate::dimse::cmove::movescu::MoveError;
use crate::error::{Categorized, Category};
use crate::inference::{MetadataDetails, Resource, ResourceInterface};
use crate::types::UI;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result of retrieving one resource: the SOP instance UIDs deposited in
/// the target directory.
#[derive(Debug, Default)]
pub struct RetrieveOutcome {
	pub instances: Vec<UI>,
}

impl RetrieveOutcome {
	pub fn count(&self) -> usize {
		self.instances.len()
	}
}

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error("Resource is not retrievable: {0}")]
	BadResource(String),
	#[error("Retrieval timed out")]
	Timeout,
	#[error(transparent)]
	Find(#[from] FindError),
	#[error(transparent)]
	Move(#[from] MoveError),
	#[error("DICOMweb request failed: {0}")]
	Web(#[from] reqwest::Error),
	#[error("DICOMweb returned status {0}")]
	WebStatus(u16),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("Retrieval was cancelled")]
	Cancelled,
}

impl Categorized for RetrieveError {
	fn category(&self) -> Category {
		match self {
			Self::BadResource(_) => Category::PermanentRemote,
			Self::Timeout => Category::TransientRemote,
			Self::Find(_) | Self::Move(_) | Self::Web(_) => Category::TransientRemote,
			Self::WebStatus(status) if (500..=599).contains(status) => {
				Category::TransientRemote
			}
			Self::WebStatus(_) => Category::PermanentRemote,
			Self::Io(_) => Category::TransientIo,
			Self::Cancelled => Category::Cancelled,
		}
	}
}

/// Retrieves the data selected by `selector` from `resource` into the
/// `target` directory. DIMSE-level retries happen inside the
/// implementation; callers only see the transient/permanent distinction
/// through [`RetrieveError::category`].
#[async_trait]
pub trait Retriever: Send + Sync {
	async fn retrieve(
		&self,
		resource: &Resource,
		selector: &MetadataDetails,
		target: &Path,
		cancel: &CancellationToken,
	) -> Result<RetrieveOutcome, RetrieveError>;
}

/// Dispatches to the DIMSE or DICOMweb implementation by resource
/// interface.
pub struct CompositeRetriever {
	dimse: DimseRetriever,
	web: DicomWebRetriever,
}

impl CompositeRetriever {
	pub fn new(dimse: DimseRetriever, web: DicomWebRetriever) -> Self {
		Self { dimse, web }
	}
}

#[async_trait]
impl Retriever for CompositeRetriever {
	async fn retrieve(
		&self,
		resource: &Resource,
		selector: &MetadataDetails,
		target: &Path,
		cancel: &CancellationToken,
	) -> Result<RetrieveOutcome, RetrieveError> {
		match resource.interface {
			ResourceInterface::Dimse => {
				self.dimse.retrieve(resource, selector, target, cancel).await
			}
			ResourceInterface::DicomWeb => {
				self.web.retrieve(resource, selector, target, cancel).await
			}
			ResourceInterface::Algorithm => Err(RetrieveError::BadResource(String::from(
				"Algorithm resources carry no data",
			))),
		}
	}
}
