use super::{JobPriority, JobTicket, PlatformClient, PlatformError};
use crate::config::PlatformConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

/// Default HTTP implementation of the platform API.
pub struct HttpPlatformClient {
	http: reqwest::Client,
	base: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobReply {
	job_id: String,
	payload_id: String,
}

impl HttpPlatformClient {
	pub fn new(config: &PlatformConfig) -> Result<Self, PlatformError> {
		let base = Url::parse(&config.endpoint)?;
		let http = reqwest::Client::builder()
			.timeout(config.timeout())
			.build()?;
		Ok(Self { http, base })
	}

	fn endpoint(&self, path: &str) -> Result<Url, PlatformError> {
		Ok(self.base.join(path)?)
	}

	fn map_error(err: reqwest::Error) -> PlatformError {
		if err.is_timeout() {
			PlatformError::Timeout
		} else {
			PlatformError::Transport(err)
		}
	}

	fn check_status(response: &reqwest::Response) -> Result<(), PlatformError> {
		let status = response.status();
		if status.is_success() {
			Ok(())
		} else {
			Err(PlatformError::Status(status.as_u16()))
		}
	}
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
	async fn create_job(
		&self,
		pipeline_id: &str,
		job_name: &str,
		priority: JobPriority,
		metadata: &BTreeMap<String, String>,
	) -> Result<JobTicket, PlatformError> {
		let response = self
			.http
			.post(self.endpoint("api/v1/jobs")?)
			.json(&json!({
				"pipelineId": pipeline_id,
				"jobName": job_name,
				"jobPriority": priority.as_str(),
				"metadata": metadata,
			}))
			.send()
			.await
			.map_err(Self::map_error)?;
		Self::check_status(&response)?;

		let reply: CreateJobReply = response
			.json()
			.await
			.map_err(|err| PlatformError::MalformedReply(err.to_string()))?;

		Ok(JobTicket {
			job_id: reply.job_id,
			payload_id: reply.payload_id,
		})
	}

	async fn upload_payload(
		&self,
		payload_id: &str,
		files: &[PathBuf],
	) -> Result<(), PlatformError> {
		for file in files {
			let name = file
				.file_name()
				.map(|name| name.to_string_lossy().into_owned())
				.unwrap_or_default();
			let bytes = tokio::fs::read(file).await?;

			let response = self
				.http
				.put(self.endpoint(&format!("api/v1/payloads/{payload_id}/files"))?)
				.query(&[("name", name.as_str())])
				.body(bytes)
				.send()
				.await
				.map_err(Self::map_error)?;
			Self::check_status(&response)?;
		}
		Ok(())
	}

	async fn start_job(&self, job_id: &str) -> Result<(), PlatformError> {
		let response = self
			.http
			.post(self.endpoint(&format!("api/v1/jobs/{job_id}/start"))?)
			.send()
			.await
			.map_err(Self::map_error)?;
		Self::check_status(&response)
	}
}
