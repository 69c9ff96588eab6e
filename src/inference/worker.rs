use crate::error::{Backoff, Categorized, Category};
use crate::inference::store::RequestStore;
use crate::inference::{InferenceRequest, RequestState, RequestStatus, Resource};
use crate::platform::{JobReceipt, JobSink, JobSubmission};
use crate::retrieve::Retriever;
use crate::storage::StagingStore;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
	/// Transient-failure budget per request.
	pub max_retries: u32,
	/// Budget for retrieving one input resource.
	pub retrieve_timeout: Duration,
	/// Fallback polling interval for due re-queued requests.
	pub poll_interval: Duration,
	/// Delay schedule for re-queued requests.
	pub retry_backoff: Backoff,
}

impl Default for WorkerOptions {
	fn default() -> Self {
		Self {
			max_retries: 3,
			retrieve_timeout: Duration::from_secs(600),
			poll_interval: Duration::from_millis(500),
			retry_backoff: Backoff {
				base: Duration::from_secs(1),
				factor: 2,
				cap: Duration::from_secs(60),
				max_attempts: u32::MAX,
			},
		}
	}
}

/// How one processing attempt ended short of success.
struct Failure {
	detail: String,
	category: Category,
}

impl Failure {
	fn from_error(err: &(dyn std::error::Error + '_), category: Category) -> Self {
		Self {
			detail: err.to_string(),
			category,
		}
	}
}

/// Drives claimed inference requests end-to-end:
/// staging, ordered retrieval, job submission, completion.
///
/// Transient failures re-queue the request with a backoff delay until the
/// retry budget is exhausted; permanent failures complete it as Fail
/// immediately. Cancellation is honored at resource boundaries.
pub struct RequestWorker {
	store: Arc<RequestStore>,
	staging: Arc<StagingStore>,
	retriever: Arc<dyn Retriever>,
	submitter: Arc<dyn JobSink>,
	options: WorkerOptions,
}

impl RequestWorker {
	pub fn new(
		store: Arc<RequestStore>,
		staging: Arc<StagingStore>,
		retriever: Arc<dyn Retriever>,
		submitter: Arc<dyn JobSink>,
		options: WorkerOptions,
	) -> Arc<Self> {
		Arc::new(Self {
			store,
			staging,
			retriever,
			submitter,
			options,
		})
	}

	pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
		info!("Inference request worker started");
		loop {
			if shutdown.is_cancelled() {
				break;
			}

			match self.store.claim_next().await {
				Ok(Some(request)) => self.process(request, &shutdown).await,
				Ok(None) => {
					tokio::select! {
						() = shutdown.cancelled() => break,
						() = self.store.wait_for_work() => {}
						() = tokio::time::sleep(self.options.poll_interval) => {}
					}
				}
				Err(err) => {
					error!("Failed to claim next request: {err}");
					tokio::time::sleep(self.options.poll_interval).await;
				}
			}
		}
		info!("Inference request worker stopped");
	}

	#[instrument(skip_all, fields(inference_request_id = %request.inference_request_id))]
	async fn process(&self, mut request: InferenceRequest, shutdown: &CancellationToken) {
		let attempt = request.try_count;
		info!(
			transaction_id = request.transaction_id,
			attempt, "Processing inference request"
		);

		match self.drive(&mut request, shutdown).await {
			Ok(receipt) => {
				request.job_id = Some(receipt.job_id.clone());
				request.payload_id = Some(receipt.payload_id.clone());
				request.status = RequestStatus::Success;
				request.state = RequestState::Completed;
				info!(job_id = receipt.job_id, "Inference request completed");
			}
			Err(failure) => self.dispose(&mut request, failure),
		}

		if let Err(err) = self.store.update(request) {
			error!("Failed to persist request outcome: {err}");
		}
	}

	/// One processing attempt. Returns the job receipt on success.
	async fn drive(
		&self,
		request: &mut InferenceRequest,
		shutdown: &CancellationToken,
	) -> Result<JobReceipt, Failure> {
		let storage_dir = self.ensure_storage(request).await?;
		let cancel = shutdown.child_token();

		let resources: Vec<Resource> = request.data_resources().cloned().collect();
		let mut total = 0usize;
		for resource in &resources {
			if self.cancel_requested(request.inference_request_id).await {
				cancel.cancel();
				return Err(Failure {
					detail: String::from("cancelled during retrieval"),
					category: Category::Cancelled,
				});
			}

			let retrieved = tokio::time::timeout(
				self.options.retrieve_timeout,
				self.retriever.retrieve(
					resource,
					&request.input_metadata.details,
					&storage_dir,
					&cancel,
				),
			)
			.await;

			let count = match retrieved {
				Err(_) => {
					return Err(Failure {
						detail: String::from("retrieval timed out"),
						category: Category::TransientRemote,
					})
				}
				Ok(Err(err)) => {
					let category = err.category();
					return Err(Failure::from_error(&err, category));
				}
				Ok(Ok(outcome)) => outcome.count(),
			};

			total += count;
			if count == 0 && !resource.connection_details.fallback {
				// Without the fallback flag an empty resource ends the
				// chain; whether that fails the request depends on what
				// earlier resources produced.
				break;
			}
		}

		if total == 0 {
			return Err(Failure {
				detail: String::from("no instances were retrieved for this request"),
				category: Category::PermanentRemote,
			});
		}

		if self.cancel_requested(request.inference_request_id).await {
			return Err(Failure {
				detail: String::from("cancelled before submission"),
				category: Category::Cancelled,
			});
		}

		self.submit(request, &storage_dir).await
	}

	/// Acquires the staging scope, assigning `storage_path` exactly once.
	/// Re-acquiring the scope of an earlier attempt yields the same
	/// directory.
	async fn ensure_storage(&self, request: &mut InferenceRequest) -> Result<PathBuf, Failure> {
		let scope = format!("request-{}", request.inference_request_id);
		let handle = self.staging.acquire(&scope).map_err(|err| {
			let category = err.category();
			Failure::from_error(&err, category)
		})?;

		if request.storage_path.is_none() {
			request.storage_path = Some(handle.dir().to_path_buf());
			self.store.update(request.clone()).map_err(|err| Failure {
				detail: format!("failed to persist storage path: {err}"),
				category: Category::TransientIo,
			})?;
		}
		Ok(handle.dir().to_path_buf())
	}

	async fn submit(
		&self,
		request: &InferenceRequest,
		storage_dir: &std::path::Path,
	) -> Result<JobReceipt, Failure> {
		let algorithm = request
			.algorithm()
			.expect("validated at enqueue: exactly one Algorithm resource");
		let pipeline_id = algorithm
			.connection_details
			.id
			.clone()
			.expect("validated at enqueue: Algorithm resource has a pipeline id");
		let name_seed = algorithm
			.connection_details
			.name
			.clone()
			.unwrap_or_else(|| pipeline_id.clone());

		let payload_files = collect_files(storage_dir).await.map_err(|err| Failure {
			detail: format!("failed to list staged files: {err}"),
			category: Category::TransientIo,
		})?;

		let mut metadata = BTreeMap::new();
		metadata.insert(
			String::from("transaction-id"),
			request.transaction_id.clone(),
		);
		metadata.insert(
			String::from("inference-request-id"),
			request.inference_request_id.to_string(),
		);

		self.submitter
			.submit(JobSubmission {
				pipeline_id,
				name_seed,
				priority: request.priority,
				metadata,
				payload_files,
			})
			.await
			.map_err(|err| {
				let category = err.category();
				Failure::from_error(&err, category)
			})
	}

	/// Terminal or retrying disposition after a failed attempt.
	fn dispose(&self, request: &mut InferenceRequest, failure: Failure) {
		request.errors.push(failure.detail.clone());

		if failure.category.is_retryable() {
			request.try_count += 1;
			if request.try_count < self.options.max_retries {
				let delay = self
					.options
					.retry_backoff
					.delay(request.try_count - 1)
					.unwrap_or(self.options.retry_backoff.cap);
				request.state = RequestState::Queued;
				request.not_before = Some(Utc::now() + chrono::Duration::from_std(delay)
					.unwrap_or_else(|_| chrono::Duration::seconds(60)));
				warn!(
					try_count = request.try_count,
					"Transient failure, re-queued: {}", failure.detail
				);
				return;
			}
			warn!("Retry budget exhausted: {}", failure.detail);
		} else {
			warn!(category = ?failure.category, "Request failed: {}", failure.detail);
		}

		request.status = RequestStatus::Fail;
		request.state = RequestState::Completed;
	}

	async fn cancel_requested(&self, id: Uuid) -> bool {
		self.store
			.get(id)
			.ok()
			.flatten()
			.map(|request| request.cancel_requested)
			.unwrap_or(false)
	}
}

/// Regular files in the staging directory, sorted by name for a stable
/// payload order.
async fn collect_files(dir: &std::path::Path) -> Result<Vec<PathBuf>, std::io::Error> {
	let mut entries = tokio::fs::read_dir(dir).await?;
	let mut files = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		if entry.file_type().await?.is_file() {
			files.push(entry.path());
		}
	}
	files.sort();
	Ok(files)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::StorageConfig;
	use crate::inference::fixtures::valid_request;
	use crate::platform::PlatformError;
	use crate::retrieve::{RetrieveError, RetrieveOutcome};
	use async_trait::async_trait;
	use std::path::Path;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Mutex;
	use tempfile::tempdir;

	struct StubRetriever {
		instances_per_call: usize,
		calls: AtomicU32,
	}

	#[async_trait]
	impl Retriever for StubRetriever {
		async fn retrieve(
			&self,
			_resource: &Resource,
			_selector: &crate::inference::MetadataDetails,
			target: &Path,
			_cancel: &CancellationToken,
		) -> Result<RetrieveOutcome, RetrieveError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst);
			let mut instances = Vec::new();
			for index in 0..self.instances_per_call {
				let sop = format!("1.2.3.{call}.{index}");
				tokio::fs::write(target.join(format!("{sop}.dcm")), b"DICM")
					.await
					.unwrap();
				instances.push(sop);
			}
			Ok(RetrieveOutcome { instances })
		}
	}

	struct ScriptedSink {
		failures_left: AtomicU32,
		status: u16,
		submissions: Mutex<Vec<JobSubmission>>,
	}

	impl ScriptedSink {
		fn succeeding() -> Arc<Self> {
			Self::failing(0, 500)
		}

		fn failing(times: u32, status: u16) -> Arc<Self> {
			Arc::new(Self {
				failures_left: AtomicU32::new(times),
				status,
				submissions: Mutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl JobSink for ScriptedSink {
		async fn submit(&self, job: JobSubmission) -> Result<JobReceipt, PlatformError> {
			let left = self.failures_left.load(Ordering::SeqCst);
			if left > 0 {
				self.failures_left.store(left - 1, Ordering::SeqCst);
				return Err(PlatformError::Status(self.status));
			}
			self.submissions.lock().unwrap().push(job);
			Ok(JobReceipt {
				job_id: String::from("job-77"),
				payload_id: String::from("payload-77"),
				job_name: String::from("liver-seg-01-000000"),
				submitted_at: Utc::now(),
			})
		}
	}

	struct Harness {
		_dir: tempfile::TempDir,
		store: Arc<RequestStore>,
		sink: Arc<ScriptedSink>,
		retriever: Arc<StubRetriever>,
		shutdown: CancellationToken,
	}

	fn harness(sink: Arc<ScriptedSink>, instances_per_call: usize) -> Harness {
		let dir = tempdir().unwrap();
		let store = RequestStore::open(&dir.path().join("db")).unwrap();
		let staging = StagingStore::new(&StorageConfig {
			staging_root: dir.path().join("staging"),
			database_path: dir.path().join("unused"),
			..StorageConfig::default()
		})
		.unwrap();
		let retriever = Arc::new(StubRetriever {
			instances_per_call,
			calls: AtomicU32::new(0),
		});

		let options = WorkerOptions {
			max_retries: 3,
			retrieve_timeout: Duration::from_secs(5),
			poll_interval: Duration::from_millis(10),
			retry_backoff: Backoff {
				base: Duration::from_millis(5),
				factor: 2,
				cap: Duration::from_millis(20),
				max_attempts: u32::MAX,
			},
		};

		let worker = RequestWorker::new(
			Arc::clone(&store),
			staging,
			Arc::clone(&retriever) as Arc<dyn Retriever>,
			Arc::clone(&sink) as Arc<dyn JobSink>,
			options,
		);
		let shutdown = CancellationToken::new();
		tokio::spawn(worker.run(shutdown.clone()));

		Harness {
			_dir: dir,
			store,
			sink,
			retriever,
			shutdown,
		}
	}

	async fn wait_for_completion(store: &RequestStore, id: Uuid) -> InferenceRequest {
		for _ in 0..500 {
			if let Some(request) = store.get(id).unwrap() {
				if request.state == RequestState::Completed {
					return request;
				}
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("request {id} did not complete in time");
	}

	#[tokio::test]
	async fn request_round_trip_completes_with_success() {
		let harness = harness(ScriptedSink::succeeding(), 2);
		let id = harness.store.enqueue(valid_request()).unwrap();

		let done = wait_for_completion(&harness.store, id).await;
		harness.shutdown.cancel();

		assert_eq!(done.status, RequestStatus::Success);
		assert_eq!(done.try_count, 0);
		assert_eq!(done.job_id.as_deref(), Some("job-77"));
		assert_eq!(done.payload_id.as_deref(), Some("payload-77"));
		assert!(done.storage_path.is_some());

		// One data resource, one retrieval, one submission.
		assert_eq!(harness.retriever.calls.load(Ordering::SeqCst), 1);
		let submissions = harness.sink.submissions.lock().unwrap();
		assert_eq!(submissions.len(), 1);
		assert_eq!(submissions[0].pipeline_id, "pipe-1");
		assert_eq!(submissions[0].payload_files.len(), 2);
	}

	#[tokio::test]
	async fn transient_platform_failures_are_retried() {
		let harness = harness(ScriptedSink::failing(2, 500), 1);
		let id = harness.store.enqueue(valid_request()).unwrap();

		let done = wait_for_completion(&harness.store, id).await;
		harness.shutdown.cancel();

		assert_eq!(done.status, RequestStatus::Success);
		assert_eq!(done.try_count, 2);
		assert_eq!(done.errors.len(), 2);
		assert_eq!(harness.sink.submissions.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn storage_path_is_stable_across_retries() {
		let harness = harness(ScriptedSink::failing(1, 500), 1);
		let id = harness.store.enqueue(valid_request()).unwrap();

		let done = wait_for_completion(&harness.store, id).await;
		harness.shutdown.cancel();

		let path = done.storage_path.unwrap();
		assert!(path
			.file_name()
			.unwrap()
			.to_string_lossy()
			.contains(&id.to_string()));
	}

	#[tokio::test]
	async fn permanent_platform_failure_fails_immediately() {
		let harness = harness(ScriptedSink::failing(1, 400), 1);
		let id = harness.store.enqueue(valid_request()).unwrap();

		let done = wait_for_completion(&harness.store, id).await;
		harness.shutdown.cancel();

		assert_eq!(done.status, RequestStatus::Fail);
		assert_eq!(done.try_count, 0);
		assert!(harness.sink.submissions.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn empty_retrieval_fails_without_retry() {
		let harness = harness(ScriptedSink::succeeding(), 0);
		let id = harness.store.enqueue(valid_request()).unwrap();

		let done = wait_for_completion(&harness.store, id).await;
		harness.shutdown.cancel();

		assert_eq!(done.status, RequestStatus::Fail);
		assert!(done
			.errors
			.iter()
			.any(|detail| detail.contains("no instances")));
	}

	#[tokio::test]
	async fn retry_budget_exhaustion_fails_the_request() {
		let harness = harness(ScriptedSink::failing(10, 503), 1);
		let id = harness.store.enqueue(valid_request()).unwrap();

		let done = wait_for_completion(&harness.store, id).await;
		harness.shutdown.cancel();

		assert_eq!(done.status, RequestStatus::Fail);
		assert_eq!(done.try_count, 3);
	}
}
