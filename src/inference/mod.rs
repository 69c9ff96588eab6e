//! Inference request model, validation and processing.
//!
//! Requests arrive from the administrative API as JSON, are validated and
//! persisted by the [`store`], and driven through retrieval and submission
//! by the [`worker`].

pub mod store;
pub mod worker;

use crate::error::{Categorized, Category};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Lifecycle of one request. Re-queues after a transient failure and on
/// process restart step back to `Queued`; within a single processing
/// attempt the state only moves forward.
#[derive(
	Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum RequestState {
	#[default]
	Queued,
	InProcess,
	Completed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestStatus {
	#[default]
	Unknown,
	Success,
	Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMetadata {
	pub details: MetadataDetails,
}

/// Selector describing which data the request wants retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MetadataDetails {
	#[serde(rename = "DICOM_UID")]
	DicomUid { studies: Vec<DicomStudy> },
	#[serde(rename = "DICOM_PATIENT_ID")]
	DicomPatientId {
		#[serde(rename = "patientID")]
		patient_id: String,
	},
	#[serde(rename = "ACCESSION_NUMBER")]
	AccessionNumber {
		#[serde(rename = "accessionNumbers")]
		accession_numbers: Vec<String>,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DicomStudy {
	#[serde(rename = "studyInstanceUid")]
	pub study_instance_uid: String,
	/// Optional narrowing to specific series of the study.
	#[serde(default)]
	pub series: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceInterface {
	Algorithm,
	#[serde(rename = "DIMSE")]
	Dimse,
	#[serde(rename = "DICOMweb")]
	DicomWeb,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthType {
	#[default]
	None,
	Basic,
	Bearer,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
	/// Display name; for Algorithm resources the algorithm name.
	#[serde(default)]
	pub name: Option<String>,
	/// Pipeline id for Algorithm resources.
	#[serde(default)]
	pub id: Option<String>,
	/// Base URI for DICOMweb resources.
	#[serde(default)]
	pub uri: Option<String>,
	/// Target AE title for DIMSE resources.
	#[serde(default)]
	pub aet: Option<String>,
	#[serde(default)]
	pub host: Option<String>,
	#[serde(default)]
	pub port: Option<u16>,
	#[serde(default)]
	pub auth_type: AuthType,
	#[serde(default, rename = "authID")]
	pub auth_id: Option<String>,
	/// Continue with the next resource even when this one yields nothing.
	#[serde(default)]
	pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
	pub interface: ResourceInterface,
	#[serde(default)]
	pub connection_details: ConnectionDetails,
}

/// One inference request, as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
	#[serde(default = "Uuid::new_v4")]
	pub inference_request_id: Uuid,
	#[serde(rename = "transactionID")]
	pub transaction_id: String,
	#[serde(default = "default_priority")]
	pub priority: u8,
	pub input_metadata: InputMetadata,
	pub input_resources: Vec<Resource>,
	#[serde(default)]
	pub output_resources: Vec<Resource>,

	#[serde(default)]
	pub state: RequestState,
	#[serde(default)]
	pub status: RequestStatus,
	#[serde(default)]
	pub try_count: u32,
	#[serde(default)]
	pub storage_path: Option<PathBuf>,
	#[serde(default)]
	pub job_id: Option<String>,
	#[serde(default)]
	pub payload_id: Option<String>,
	/// Earliest time a re-queued request becomes claimable again.
	#[serde(default)]
	pub not_before: Option<DateTime<Utc>>,
	/// Set by an external cancel; honored at resource boundaries.
	#[serde(default)]
	pub cancel_requested: bool,
	/// Human-readable failure details accumulated over attempts.
	#[serde(default)]
	pub errors: Vec<String>,
	#[serde(default = "Utc::now")]
	pub created_at: DateTime<Utc>,
	#[serde(default = "Utc::now")]
	pub updated_at: DateTime<Utc>,
}

const fn default_priority() -> u8 {
	128
}

#[derive(Debug, Error)]
#[error("Invalid inference request: {}", details.join("; "))]
pub struct ValidationError {
	pub details: Vec<String>,
}

impl Categorized for ValidationError {
	fn category(&self) -> Category {
		Category::ValidationFailed
	}
}

impl InferenceRequest {
	pub fn algorithm(&self) -> Option<&Resource> {
		self.input_resources
			.iter()
			.find(|resource| resource.interface == ResourceInterface::Algorithm)
	}

	/// Data-source input resources in declared order.
	pub fn data_resources(&self) -> impl Iterator<Item = &Resource> {
		self.input_resources
			.iter()
			.filter(|resource| resource.interface != ResourceInterface::Algorithm)
	}

	/// Checks every acceptance rule and collects the violations. A request
	/// is accepted iff no rule is violated.
	pub fn validate(&self) -> Result<(), ValidationError> {
		let mut details = Vec::new();

		if self.transaction_id.trim().is_empty() {
			details.push(String::from("transactionID must not be empty"));
		}

		let algorithms = self
			.input_resources
			.iter()
			.filter(|resource| resource.interface == ResourceInterface::Algorithm)
			.count();
		match algorithms {
			0 => details.push(String::from(
				"exactly one Algorithm input resource is required",
			)),
			1 => {
				let algorithm = self.algorithm().expect("counted above");
				if algorithm
					.connection_details
					.id
					.as_deref()
					.is_none_or(str::is_empty)
				{
					details.push(String::from("Algorithm resource requires a pipeline id"));
				}
			}
			_ => details.push(String::from(
				"multiple Algorithm input resources are not allowed",
			)),
		}

		if self.data_resources().next().is_none() {
			details.push(String::from(
				"at least one data source input resource is required",
			));
		}

		match &self.input_metadata.details {
			MetadataDetails::DicomUid { studies } => {
				if studies.is_empty() {
					details.push(String::from("inputMetadata studies must not be empty"));
				}
				for study in studies {
					if study.study_instance_uid.trim().is_empty() {
						details.push(String::from("study instance UID must not be empty"));
					}
				}
			}
			MetadataDetails::DicomPatientId { patient_id } => {
				if patient_id.trim().is_empty() {
					details.push(String::from("inputMetadata patientID must not be empty"));
				}
			}
			MetadataDetails::AccessionNumber { accession_numbers } => {
				if accession_numbers.is_empty() {
					details.push(String::from(
						"inputMetadata accessionNumbers must not be empty",
					));
				}
			}
		}

		for resource in self.data_resources() {
			let connection = &resource.connection_details;
			match resource.interface {
				ResourceInterface::DicomWeb => {
					match connection.uri.as_deref() {
						None | Some("") => {
							details.push(String::from("DICOMweb resource requires a URI"));
						}
						Some(uri) => match Url::parse(uri) {
							Ok(url) if url.has_host() => {}
							_ => details.push(format!(
								"DICOMweb URI '{uri}' is not an absolute URI"
							)),
						},
					}
					if connection.auth_type != AuthType::None
						&& connection.auth_id.as_deref().is_none_or(str::is_empty)
					{
						details.push(String::from(
							"authID is required when authType is not None",
						));
					}
				}
				ResourceInterface::Dimse => {
					if connection.aet.as_deref().is_none_or(str::is_empty)
						|| connection.host.as_deref().is_none_or(str::is_empty)
						|| connection.port.is_none()
					{
						details.push(String::from(
							"DIMSE resource requires aet, host and port",
						));
					}
				}
				ResourceInterface::Algorithm => {}
			}
		}

		if details.is_empty() {
			Ok(())
		} else {
			Err(ValidationError { details })
		}
	}
}

#[cfg(test)]
pub(crate) mod fixtures {
	use super::*;

	pub(crate) fn algorithm_resource(id: &str) -> Resource {
		Resource {
			interface: ResourceInterface::Algorithm,
			connection_details: ConnectionDetails {
				name: Some(String::from("liver-seg")),
				id: Some(String::from(id)),
				..ConnectionDetails::default()
			},
		}
	}

	pub(crate) fn dimse_resource() -> Resource {
		Resource {
			interface: ResourceInterface::Dimse,
			connection_details: ConnectionDetails {
				aet: Some(String::from("PACS1")),
				host: Some(String::from("pacs.example.org")),
				port: Some(104),
				..ConnectionDetails::default()
			},
		}
	}

	pub(crate) fn dicomweb_resource(uri: &str) -> Resource {
		Resource {
			interface: ResourceInterface::DicomWeb,
			connection_details: ConnectionDetails {
				uri: Some(String::from(uri)),
				..ConnectionDetails::default()
			},
		}
	}

	pub(crate) fn valid_request() -> InferenceRequest {
		InferenceRequest {
			inference_request_id: Uuid::new_v4(),
			transaction_id: String::from("txn-1"),
			priority: 128,
			input_metadata: InputMetadata {
				details: MetadataDetails::DicomUid {
					studies: vec![DicomStudy {
						study_instance_uid: String::from("1.2.3"),
						series: Vec::new(),
					}],
				},
			},
			input_resources: vec![algorithm_resource("pipe-1"), dimse_resource()],
			output_resources: Vec::new(),
			state: RequestState::default(),
			status: RequestStatus::default(),
			try_count: 0,
			storage_path: None,
			job_id: None,
			payload_id: None,
			not_before: None,
			cancel_requested: false,
			errors: Vec::new(),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}
}
