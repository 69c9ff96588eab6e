use super::{RetrieveError, RetrieveOutcome, Retriever};
use crate::inference::{AuthType, ConnectionDetails, DicomStudy, MetadataDetails, Resource};
use crate::types::UI;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// DICOM JSON tag for Study Instance UID.
const TAG_STUDY_INSTANCE_UID: &str = "0020000D";
/// DICOM JSON tag for Series Instance UID.
const TAG_SERIES_INSTANCE_UID: &str = "0020000E";
/// DICOM JSON tag for SOP Instance UID.
const TAG_SOP_INSTANCE_UID: &str = "00080018";

/// Retrieval over DICOMweb: QIDO-RS resolves patient/accession selectors
/// and lists instances, WADO-RS fetches each instance as
/// `application/dicom`.
pub struct DicomWebRetriever {
	http: reqwest::Client,
}

impl DicomWebRetriever {
	pub fn new(timeout: Duration) -> Result<Self, RetrieveError> {
		let http = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self { http })
	}

	fn base_url(details: &ConnectionDetails) -> Result<Url, RetrieveError> {
		let uri = details.uri.as_deref().ok_or_else(|| {
			RetrieveError::BadResource(String::from("DICOMweb resource requires a URI"))
		})?;
		// A trailing slash makes Url::join treat the last segment as a
		// directory.
		let uri = if uri.ends_with('/') {
			uri.to_string()
		} else {
			format!("{uri}/")
		};
		Url::parse(&uri)
			.map_err(|err| RetrieveError::BadResource(format!("Bad DICOMweb URI: {err}")))
	}

	fn authorized(details: &ConnectionDetails, request: RequestBuilder) -> RequestBuilder {
		match (&details.auth_type, details.auth_id.as_deref()) {
			(AuthType::Basic, Some(credentials)) => {
				request.header(AUTHORIZATION, format!("Basic {credentials}"))
			}
			(AuthType::Bearer, Some(token)) => {
				request.header(AUTHORIZATION, format!("Bearer {token}"))
			}
			_ => request,
		}
	}

	/// QIDO query string for a non-UID selector.
	fn qido_filters(selector: &MetadataDetails) -> Vec<(&'static str, String)> {
		match selector {
			MetadataDetails::DicomUid { .. } => Vec::new(),
			MetadataDetails::DicomPatientId { patient_id } => {
				vec![("PatientID", patient_id.clone())]
			}
			MetadataDetails::AccessionNumber { accession_numbers } => accession_numbers
				.iter()
				.map(|accession| ("AccessionNumber", accession.clone()))
				.collect(),
		}
	}

	/// Reads a QIDO-RS reply, treating 204 as an empty match list.
	async fn qido_results(response: Response) -> Result<Vec<Value>, RetrieveError> {
		match response.status() {
			StatusCode::NO_CONTENT => Ok(Vec::new()),
			status if status.is_success() => Ok(response.json().await?),
			status => Err(RetrieveError::WebStatus(status.as_u16())),
		}
	}

	fn first_value(item: &Value, tag: &str) -> Option<String> {
		item.get(tag)?
			.get("Value")?
			.get(0)?
			.as_str()
			.map(String::from)
	}

	async fn resolve_studies(
		&self,
		details: &ConnectionDetails,
		base: &Url,
		selector: &MetadataDetails,
	) -> Result<Vec<DicomStudy>, RetrieveError> {
		if let MetadataDetails::DicomUid { studies } = selector {
			return Ok(studies.clone());
		}

		let mut studies = Vec::new();
		for (field, value) in Self::qido_filters(selector) {
			let request = self
				.http
				.get(base.join("studies").expect("studies is a valid segment"))
				.query(&[(field, value)]);
			let response = Self::authorized(details, request).send().await?;

			for item in Self::qido_results(response).await? {
				let Some(uid) = Self::first_value(&item, TAG_STUDY_INSTANCE_UID) else {
					continue;
				};
				if !studies
					.iter()
					.any(|study: &DicomStudy| study.study_instance_uid == uid)
				{
					studies.push(DicomStudy {
						study_instance_uid: uid,
						series: Vec::new(),
					});
				}
			}
		}
		Ok(studies)
	}

	/// Lists (series UID, SOP UID) pairs of one study via QIDO-RS.
	async fn list_instances(
		&self,
		details: &ConnectionDetails,
		base: &Url,
		study: &DicomStudy,
	) -> Result<Vec<(UI, UI)>, RetrieveError> {
		let url = base
			.join(&format!("studies/{}/instances", study.study_instance_uid))
			.map_err(|err| RetrieveError::BadResource(err.to_string()))?;
		let response = Self::authorized(details, self.http.get(url)).send().await?;

		let mut instances = Vec::new();
		for item in Self::qido_results(response).await? {
			let series = Self::first_value(&item, TAG_SERIES_INSTANCE_UID);
			let sop = Self::first_value(&item, TAG_SOP_INSTANCE_UID);
			if let (Some(series), Some(sop)) = (series, sop) {
				if study.series.is_empty() || study.series.contains(&series) {
					instances.push((series, sop));
				}
			}
		}
		Ok(instances)
	}

	async fn fetch_instance(
		&self,
		details: &ConnectionDetails,
		base: &Url,
		study_uid: &str,
		series_uid: &str,
		sop_uid: &str,
		target: &Path,
	) -> Result<(), RetrieveError> {
		let url = base
			.join(&format!(
				"studies/{study_uid}/series/{series_uid}/instances/{sop_uid}"
			))
			.map_err(|err| RetrieveError::BadResource(err.to_string()))?;
		let request = self.http.get(url).header(ACCEPT, "application/dicom");
		let response = Self::authorized(details, request).send().await?;

		if !response.status().is_success() {
			return Err(RetrieveError::WebStatus(response.status().as_u16()));
		}
		let bytes = response.bytes().await?;
		tokio::fs::write(target.join(format!("{sop_uid}.dcm")), bytes).await?;
		Ok(())
	}
}

#[async_trait]
impl Retriever for DicomWebRetriever {
	async fn retrieve(
		&self,
		resource: &Resource,
		selector: &MetadataDetails,
		target: &Path,
		cancel: &CancellationToken,
	) -> Result<RetrieveOutcome, RetrieveError> {
		let details = &resource.connection_details;
		let base = Self::base_url(details)?;

		let studies = self.resolve_studies(details, &base, selector).await?;
		let mut instances = Vec::new();

		for study in &studies {
			for (series_uid, sop_uid) in self.list_instances(details, &base, study).await? {
				if cancel.is_cancelled() {
					return Err(RetrieveError::Cancelled);
				}
				self.fetch_instance(
					details,
					&base,
					&study.study_instance_uid,
					&series_uid,
					&sop_uid,
					target,
				)
				.await?;
				instances.push(sop_uid);
			}
		}

		Ok(RetrieveOutcome { instances })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn qido_filters_match_selector() {
		let filters = DicomWebRetriever::qido_filters(&MetadataDetails::DicomPatientId {
			patient_id: String::from("PAT-1"),
		});
		assert_eq!(filters, vec![("PatientID", String::from("PAT-1"))]);

		let filters = DicomWebRetriever::qido_filters(&MetadataDetails::AccessionNumber {
			accession_numbers: vec![String::from("ACC-1"), String::from("ACC-2")],
		});
		assert_eq!(filters.len(), 2);
		assert_eq!(filters[0].0, "AccessionNumber");
	}

	#[test]
	fn dicom_json_values_are_extracted() {
		let item = json!({
			"0020000D": { "vr": "UI", "Value": ["1.2.3"] },
			"00080018": { "vr": "UI", "Value": ["1.2.3.4.5"] }
		});
		assert_eq!(
			DicomWebRetriever::first_value(&item, TAG_STUDY_INSTANCE_UID),
			Some(String::from("1.2.3"))
		);
		assert_eq!(
			DicomWebRetriever::first_value(&item, TAG_SOP_INSTANCE_UID),
			Some(String::from("1.2.3.4.5"))
		);
		assert_eq!(DicomWebRetriever::first_value(&item, "00100010"), None);
	}

	#[test]
	fn base_url_requires_absolute_uri() {
		let mut details = ConnectionDetails::default();
		assert!(DicomWebRetriever::base_url(&details).is_err());

		details.uri = Some(String::from("https://pacs.example.org/dicomweb"));
		let base = DicomWebRetriever::base_url(&details).unwrap();
		assert_eq!(
			base.join("studies").unwrap().as_str(),
			"https://pacs.example.org/dicomweb/studies"
		);
	}
}
