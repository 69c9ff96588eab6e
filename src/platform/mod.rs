use crate::error::{Categorized, Category};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

pub mod http;

/// Job priority understood by the inference platform.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobPriority {
	Lower,
	Normal,
	Higher,
	Immediate,
}

impl JobPriority {
	/// Total mapping from the request priority byte.
	pub const fn from_byte(priority: u8) -> Self {
		match priority {
			0..=127 => Self::Lower,
			128 => Self::Normal,
			129..=254 => Self::Higher,
			255 => Self::Immediate,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Lower => "LOWER",
			Self::Normal => "NORMAL",
			Self::Higher => "HIGHER",
			Self::Immediate => "IMMEDIATE",
		}
	}
}

/// Derives a platform job name from the algorithm name and a timestamp:
/// `{name}-{DD-HHMMSS}` in UTC, restricted to alphanumerics plus `-_` and
/// truncated to the platform maximum.
pub fn job_name(seed: &str, at: DateTime<Utc>, max_length: usize) -> String {
	let raw = format!("{}-{}", seed, at.format("%d-%H%M%S"));
	let mut name: String = raw
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				c
			} else {
				'-'
			}
		})
		.collect();
	name.truncate(max_length);
	name
}

#[derive(Debug, Error)]
pub enum PlatformError {
	#[error("Invalid platform endpoint: {0}")]
	InvalidEndpoint(#[from] url::ParseError),
	#[error("Platform transport error: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("Platform call timed out")]
	Timeout,
	#[error("Platform returned status {0}")]
	Status(u16),
	#[error("Malformed platform reply: {0}")]
	MalformedReply(String),
	#[error("Failed to read payload file: {0}")]
	Payload(#[from] std::io::Error),
}

impl Categorized for PlatformError {
	fn category(&self) -> Category {
		match self {
			Self::InvalidEndpoint(_) => Category::ConfigInvalid,
			Self::Transport(_) | Self::Timeout => Category::TransientRemote,
			Self::Status(status) if (500..=599).contains(status) => Category::TransientRemote,
			Self::Status(_) | Self::MalformedReply(_) => Category::PermanentRemote,
			Self::Payload(_) => Category::TransientIo,
		}
	}
}

/// Handle returned by [`PlatformClient::create_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
	pub job_id: String,
	pub payload_id: String,
}

/// The remote inference platform, as consumed by the adapter.
#[async_trait]
pub trait PlatformClient: Send + Sync {
	async fn create_job(
		&self,
		pipeline_id: &str,
		job_name: &str,
		priority: JobPriority,
		metadata: &BTreeMap<String, String>,
	) -> Result<JobTicket, PlatformError>;

	async fn upload_payload(
		&self,
		payload_id: &str,
		files: &[PathBuf],
	) -> Result<(), PlatformError>;

	async fn start_job(&self, job_id: &str) -> Result<(), PlatformError>;
}

/// One unit of work handed to the platform: a pipeline, the staged files
/// and the shared metadata describing them.
#[derive(Debug, Clone)]
pub struct JobSubmission {
	pub pipeline_id: String,
	/// Seed for the derived job name, usually the algorithm name.
	pub name_seed: String,
	pub priority: u8,
	pub metadata: BTreeMap<String, String>,
	pub payload_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReceipt {
	pub job_id: String,
	pub payload_id: String,
	pub job_name: String,
	pub submitted_at: DateTime<Utc>,
}

/// Anything that accepts job submissions. Implemented by [`JobSubmitter`]
/// and by test doubles.
#[async_trait]
pub trait JobSink: Send + Sync {
	async fn submit(&self, job: JobSubmission) -> Result<JobReceipt, PlatformError>;
}

/// Normalizes priority and naming, then drives the platform call sequence
/// CreateJob, UploadPayload, StartJob. A started job is terminal success;
/// the adapter does not poll job state afterwards.
pub struct JobSubmitter {
	client: Arc<dyn PlatformClient>,
	timeout: Duration,
	name_max_length: usize,
}

impl JobSubmitter {
	pub fn new(client: Arc<dyn PlatformClient>, timeout: Duration, name_max_length: usize) -> Self {
		Self {
			client,
			timeout,
			name_max_length,
		}
	}

	async fn bounded<T>(
		&self,
		call: impl std::future::Future<Output = Result<T, PlatformError>>,
	) -> Result<T, PlatformError> {
		tokio::time::timeout(self.timeout, call)
			.await
			.map_err(|_| PlatformError::Timeout)?
	}
}

#[async_trait]
impl JobSink for JobSubmitter {
	#[instrument(skip_all, fields(pipeline_id = job.pipeline_id))]
	async fn submit(&self, job: JobSubmission) -> Result<JobReceipt, PlatformError> {
		let submitted_at = Utc::now();
		let priority = JobPriority::from_byte(job.priority);
		let name = job_name(&job.name_seed, submitted_at, self.name_max_length);

		let ticket = self
			.bounded(self.client.create_job(
				&job.pipeline_id,
				&name,
				priority,
				&job.metadata,
			))
			.await?;
		self.bounded(
			self.client
				.upload_payload(&ticket.payload_id, &job.payload_files),
		)
		.await?;
		self.bounded(self.client.start_job(&ticket.job_id)).await?;

		info!(
			job_id = ticket.job_id,
			payload_id = ticket.payload_id,
			job_name = name,
			priority = priority.as_str(),
			files = job.payload_files.len(),
			"Submitted job"
		);

		Ok(JobReceipt {
			job_id: ticket.job_id,
			payload_id: ticket.payload_id,
			job_name: name,
			submitted_at,
		})
	}
}
