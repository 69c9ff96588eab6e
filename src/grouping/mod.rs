//! The instance grouping engine.
//!
//! Stored instances are bucketed by a key derived from the called AE's
//! grouping rule. A bucket closes after a sliding quiet period of silence,
//! bounded by a max-age guard, and is then submitted as one job per
//! configured pipeline.

mod timer;
pub use timer::{DeadlineScheduler, Expired, TimerCommand};

use crate::config::{CalledAeConfig, GroupingKind};
use crate::error::{Backoff, Categorized};
use crate::ingest::{Instance, InstanceEvent};
use crate::platform::{JobReceipt, JobSink, JobSubmission};
use crate::types::{AE, UI};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identity of one bucket: the called AE plus the grouping discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
	pub called_ae: AE,
	pub discriminator: Discriminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminator {
	/// Grouping disabled: every instance gets its own bucket.
	Instance(Uuid),
	PatientId(String),
	StudyInstanceUid(UI),
	CallingAet(AE),
}

impl BucketKey {
	pub fn for_event(event: &InstanceEvent) -> Self {
		let instance = &event.instance;
		let discriminator = match event.config.grouping {
			GroupingKind::None => Discriminator::Instance(Uuid::new_v4()),
			GroupingKind::PatientId => Discriminator::PatientId(instance.patient_id.clone()),
			GroupingKind::StudyInstanceUid => {
				Discriminator::StudyInstanceUid(instance.study_instance_uid.clone())
			}
			GroupingKind::CallingAet => Discriminator::CallingAet(instance.calling_ae.clone()),
		};
		Self {
			called_ae: instance.called_ae.clone(),
			discriminator,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
	Open,
	Closing,
	Closed,
}

/// Mutable grouping envelope for one key.
#[derive(Debug)]
pub struct Bucket {
	pub key: BucketKey,
	pub state: BucketState,
	pub created_at: Instant,
	pub last_instance_at: Instant,
	pub pipelines: Vec<String>,
	pub priority: u8,
	/// Distinguishes successive buckets for the same key, so a stale timer
	/// expiry cannot close a newer bucket.
	pub epoch: u64,
	quiet_period: std::time::Duration,
	max_age: std::time::Duration,
	instances: Vec<Arc<Instance>>,
	seen: HashSet<UI>,
}

impl Bucket {
	fn open(key: BucketKey, config: &CalledAeConfig, epoch: u64, now: Instant) -> Self {
		Self {
			key,
			state: BucketState::Open,
			created_at: now,
			last_instance_at: now,
			pipelines: config.pipelines.clone(),
			priority: config.priority,
			epoch,
			quiet_period: config.quiet_period(),
			max_age: config.max_age(),
			instances: Vec::new(),
			seen: HashSet::new(),
		}
	}

	/// Appends the instance unless its SOP instance UID is already a
	/// member. Returns whether the bucket changed.
	fn observe(&mut self, instance: Arc<Instance>, now: Instant) -> bool {
		self.last_instance_at = now;
		if self.seen.insert(instance.sop_instance_uid.clone()) {
			self.instances.push(instance);
			true
		} else {
			false
		}
	}

	/// Sliding quiet-period deadline, bounded by the max-age guard.
	fn deadline(&self) -> Instant {
		let quiet = self.last_instance_at + self.quiet_period;
		let bound = self.created_at + self.max_age;
		quiet.min(bound)
	}

	pub fn len(&self) -> usize {
		self.instances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.instances.is_empty()
	}

	/// Instances in receive order; ties on the receive timestamp are
	/// broken by SOP instance UID.
	fn manifest(&self) -> Vec<Arc<Instance>> {
		let mut manifest = self.instances.clone();
		manifest.sort_by(|a, b| {
			a.received_at
				.cmp(&b.received_at)
				.then_with(|| a.sop_instance_uid.cmp(&b.sop_instance_uid))
		});
		manifest
	}
}

#[derive(Debug, Clone)]
pub struct GroupingOptions {
	pub shards: usize,
	/// Capacity of the bounded close-work channel.
	pub close_queue: usize,
	/// Number of tasks draining close work.
	pub closers: usize,
	pub submit_backoff: Backoff,
}

impl Default for GroupingOptions {
	fn default() -> Self {
		Self {
			shards: 16,
			close_queue: 64,
			closers: 2,
			submit_backoff: Backoff::SUBMIT,
		}
	}
}

/// Bucket table plus the tasks that maintain it.
///
/// One dispatch task consumes instance events and upserts buckets; the
/// deadline scheduler keeps a single timer entry per key; closer tasks
/// drain expired keys from a bounded channel and submit the snapshots.
pub struct GroupingEngine {
	shards: Arc<Vec<Mutex<HashMap<BucketKey, Bucket>>>>,
	submitter: Arc<dyn JobSink>,
	options: GroupingOptions,
	epochs: AtomicU64,
}

impl GroupingEngine {
	pub fn new(submitter: Arc<dyn JobSink>, options: GroupingOptions) -> Arc<Self> {
		let shards = (0..options.shards.max(1))
			.map(|_| Mutex::new(HashMap::new()))
			.collect();
		Arc::new(Self {
			shards: Arc::new(shards),
			submitter,
			options,
			epochs: AtomicU64::new(0),
		})
	}

	/// Spawns the dispatch, scheduler and closer tasks.
	pub fn run(
		self: &Arc<Self>,
		mut events: mpsc::Receiver<InstanceEvent>,
		shutdown: CancellationToken,
	) -> Vec<JoinHandle<()>> {
		let (timer_tx, timer_rx) = mpsc::channel(self.options.close_queue);
		let (expired_tx, expired_rx) = mpsc::channel(self.options.close_queue);
		let mut handles = Vec::new();

		handles.push(tokio::spawn(DeadlineScheduler::run(
			timer_rx,
			expired_tx,
			shutdown.clone(),
		)));

		let engine = Arc::clone(self);
		let dispatch_shutdown = shutdown.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let event = tokio::select! {
					() = dispatch_shutdown.cancelled() => break,
					event = events.recv() => match event {
						Some(event) => event,
						None => break,
					},
				};
				let command = engine.record(&event);
				if timer_tx.send(command).await.is_err() {
					break;
				}
			}
			debug!("Grouping dispatch stopped");
		}));

		let expired_rx = Arc::new(tokio::sync::Mutex::new(expired_rx));
		for _ in 0..self.options.closers.max(1) {
			let engine = Arc::clone(self);
			let expired_rx = Arc::clone(&expired_rx);
			let closer_shutdown = shutdown.clone();
			handles.push(tokio::spawn(async move {
				loop {
					let expired = {
						let mut rx = expired_rx.lock().await;
						tokio::select! {
							() = closer_shutdown.cancelled() => break,
							expired = rx.recv() => match expired {
								Some(expired) => expired,
								None => break,
							},
						}
					};
					if let Some(bucket) = engine.take_expired(&expired) {
						engine.close(bucket).await;
					}
				}
				debug!("Grouping closer stopped");
			}));
		}

		handles
	}

	fn shard(&self, key: &BucketKey) -> &Mutex<HashMap<BucketKey, Bucket>> {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		let index = (hasher.finish() as usize) % self.shards.len();
		&self.shards[index]
	}

	/// Upserts the bucket for the event and returns the timer command
	/// re-arming its deadline. Serialized per shard; the lock is never
	/// held across an await point.
	fn record(&self, event: &InstanceEvent) -> TimerCommand<BucketKey> {
		let key = BucketKey::for_event(event);
		let now = Instant::now();
		let mut shard = self.shard(&key).lock().expect("bucket shard poisoned");

		let bucket = shard.entry(key.clone()).or_insert_with(|| {
			let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
			debug!(?key, epoch, "Opened bucket");
			Bucket::open(key.clone(), &event.config, epoch, now)
		});
		if !bucket.observe(Arc::clone(&event.instance), now) {
			debug!(
				sop_instance_uid = event.instance.sop_instance_uid,
				"Collapsed duplicate instance"
			);
		}

		TimerCommand::Arm {
			key,
			epoch: bucket.epoch,
			deadline: bucket.deadline(),
		}
	}

	/// Detaches the expired bucket from the table. Later events for the
	/// same key will open a fresh bucket; a stale epoch means the bucket
	/// was already replaced and the expiry is ignored.
	fn take_expired(&self, expired: &Expired<BucketKey>) -> Option<Bucket> {
		let mut shard = self
			.shard(&expired.key)
			.lock()
			.expect("bucket shard poisoned");
		match shard.get(&expired.key) {
			Some(bucket) if bucket.epoch == expired.epoch => {
				let mut bucket = shard.remove(&expired.key)?;
				bucket.state = BucketState::Closing;
				Some(bucket)
			}
			_ => None,
		}
	}

	/// Submits the bucket snapshot, one job per pipeline, retrying
	/// transient failures with exponential backoff. The bucket is already
	/// detached; dropping it here is the Closing to Closed transition.
	async fn close(&self, bucket: Bucket) {
		let manifest = bucket.manifest();
		let Some(first) = manifest.first() else {
			return;
		};

		let mut metadata = BTreeMap::new();
		metadata.insert(String::from("patient-id"), first.patient_id.clone());
		metadata.insert(
			String::from("study-instance-uid"),
			first.study_instance_uid.clone(),
		);
		metadata.insert(String::from("called-aet"), first.called_ae.clone());
		metadata.insert(String::from("calling-aet"), first.calling_ae.clone());
		metadata.insert(String::from("instances"), manifest.len().to_string());

		let payload_files: Vec<_> = manifest
			.iter()
			.map(|instance| instance.file_path.clone())
			.collect();

		for pipeline_id in &bucket.pipelines {
			let submission = JobSubmission {
				pipeline_id: pipeline_id.clone(),
				name_seed: pipeline_id.clone(),
				priority: bucket.priority,
				metadata: metadata.clone(),
				payload_files: payload_files.clone(),
			};
			match self.submit_with_backoff(submission).await {
				Some(receipt) => {
					info!(
						pipeline_id,
						job_id = receipt.job_id,
						instances = manifest.len(),
						"Bucket submitted"
					);
				}
				None => {
					// Files stay in staging until the retention reaper
					// collects them.
					error!(pipeline_id, ?bucket.key, "Bucket submission failed permanently");
				}
			}
		}
	}

	async fn submit_with_backoff(&self, submission: JobSubmission) -> Option<JobReceipt> {
		let backoff = self.options.submit_backoff;
		let mut attempt = 0;
		loop {
			match self.submitter.submit(submission.clone()).await {
				Ok(receipt) => return Some(receipt),
				Err(err) if err.category().is_retryable() => {
					attempt += 1;
					let Some(delay) = backoff.delay(attempt - 1) else {
						error!("Submission retries exhausted: {err}");
						return None;
					};
					warn!(attempt, "Submission failed, retrying in {delay:?}: {err}");
					tokio::time::sleep(delay).await;
				}
				Err(err) => {
					error!("Submission failed permanently: {err}");
					return None;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::platform::PlatformError;
	use async_trait::async_trait;
	use chrono::Utc;
	use std::path::PathBuf;
	use std::sync::atomic::AtomicU32;
	use std::time::Duration;

	struct RecordingSink {
		submissions: Mutex<Vec<JobSubmission>>,
		failures_left: AtomicU32,
		permanent: bool,
	}

	impl RecordingSink {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				submissions: Mutex::new(Vec::new()),
				failures_left: AtomicU32::new(0),
				permanent: false,
			})
		}

		fn failing(times: u32, permanent: bool) -> Arc<Self> {
			Arc::new(Self {
				submissions: Mutex::new(Vec::new()),
				failures_left: AtomicU32::new(times),
				permanent,
			})
		}

		fn submissions(&self) -> Vec<JobSubmission> {
			self.submissions.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl JobSink for RecordingSink {
		async fn submit(&self, job: JobSubmission) -> Result<JobReceipt, PlatformError> {
			let left = self.failures_left.load(Ordering::SeqCst);
			if left > 0 {
				self.failures_left.store(left - 1, Ordering::SeqCst);
				return if self.permanent {
					Err(PlatformError::Status(400))
				} else {
					Err(PlatformError::Status(503))
				};
			}
			self.submissions.lock().unwrap().push(job);
			Ok(JobReceipt {
				job_id: String::from("job-1"),
				payload_id: String::from("payload-1"),
				job_name: String::from("job-name"),
				submitted_at: Utc::now(),
			})
		}
	}

	fn config(grouping: GroupingKind, pipelines: &[&str]) -> Arc<CalledAeConfig> {
		Arc::new(CalledAeConfig {
			aet: String::from("BRIDGE1"),
			grouping,
			timeout: 5_000,
			max_age: 60_000,
			allowed_sops: Vec::new(),
			allowed_sources: Vec::new(),
			pipelines: pipelines.iter().map(|p| String::from(*p)).collect(),
			priority: 128,
		})
	}

	fn event(
		config: &Arc<CalledAeConfig>,
		sop: &str,
		study: &str,
		patient: &str,
	) -> InstanceEvent {
		InstanceEvent {
			instance: Arc::new(Instance {
				sop_instance_uid: String::from(sop),
				series_instance_uid: format!("{study}.1"),
				study_instance_uid: String::from(study),
				patient_id: String::from(patient),
				called_ae: config.aet.clone(),
				calling_ae: String::from("PACS1"),
				received_at: Utc::now(),
				file_path: PathBuf::from(format!("/staging/a/{sop}.dcm")),
				transfer_syntax: String::from("1.2.840.10008.1.2.1"),
			}),
			config: Arc::clone(config),
		}
	}

	async fn run_engine(
		sink: Arc<RecordingSink>,
	) -> (mpsc::Sender<InstanceEvent>, CancellationToken) {
		let engine = GroupingEngine::new(
			Arc::clone(&sink) as Arc<dyn JobSink>,
			GroupingOptions::default(),
		);
		let (tx, rx) = mpsc::channel(64);
		let shutdown = CancellationToken::new();
		engine.run(rx, shutdown.clone());
		(tx, shutdown)
	}

	#[tokio::test(start_paused = true)]
	async fn closes_after_quiet_period() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		events
			.send(event(&config, "1.1", "study-1", "PAT-1"))
			.await
			.unwrap();
		events
			.send(event(&config, "1.2", "study-1", "PAT-1"))
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_secs(6)).await;

		let submissions = sink.submissions();
		assert_eq!(submissions.len(), 1);
		assert_eq!(submissions[0].pipeline_id, "pipe-1");
		assert_eq!(
			submissions[0].payload_files,
			vec![
				PathBuf::from("/staging/a/1.1.dcm"),
				PathBuf::from("/staging/a/1.2.dcm"),
			]
		);
		assert_eq!(submissions[0].metadata["study-instance-uid"], "study-1");
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_sop_instances_collapse() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		for _ in 0..3 {
			events
				.send(event(&config, "1.1", "study-1", "PAT-1"))
				.await
				.unwrap();
		}

		tokio::time::sleep(Duration::from_secs(6)).await;

		let submissions = sink.submissions();
		assert_eq!(submissions.len(), 1);
		assert_eq!(submissions[0].payload_files.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn distinct_studies_make_distinct_jobs() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		for study in ["study-1", "study-2", "study-3", "study-4"] {
			events
				.send(event(&config, &format!("{study}.i"), study, "PAT-1"))
				.await
				.unwrap();
		}

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(sink.submissions().len(), 4);
	}

	#[tokio::test(start_paused = true)]
	async fn patient_grouping_fans_out_per_pipeline() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::PatientId, &["pipe-1", "pipe-2"]);

		for (study, patient) in [
			("study-1", "PAT-1"),
			("study-2", "PAT-1"),
			("study-3", "PAT-2"),
			("study-4", "PAT-2"),
		] {
			events
				.send(event(&config, &format!("{study}.i"), study, patient))
				.await
				.unwrap();
		}

		tokio::time::sleep(Duration::from_secs(6)).await;

		// 2 patients x 2 pipelines.
		let submissions = sink.submissions();
		assert_eq!(submissions.len(), 4);
		let per_patient = submissions
			.iter()
			.filter(|s| s.metadata["patient-id"] == "PAT-1")
			.count();
		assert_eq!(per_patient, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn quiet_period_slides_with_activity() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		events
			.send(event(&config, "1.1", "study-1", "PAT-1"))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(3)).await;
		events
			.send(event(&config, "1.2", "study-1", "PAT-1"))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(3)).await;
		// 6s after the first instance, 3s after the second: still open.
		assert!(sink.submissions().is_empty());

		tokio::time::sleep(Duration::from_secs(3)).await;
		let submissions = sink.submissions();
		assert_eq!(submissions.len(), 1);
		assert_eq!(submissions[0].payload_files.len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn max_age_bounds_a_busy_bucket() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		// Steady activity keeps re-arming the quiet period; the max-age
		// guard must force closure regardless.
		for second in 0..70 {
			events
				.send(event(
					&config,
					&format!("1.{second}"),
					"study-1",
					"PAT-1",
				))
				.await
				.unwrap();
			tokio::time::sleep(Duration::from_secs(1)).await;
			if !sink.submissions().is_empty() {
				break;
			}
		}

		let submissions = sink.submissions();
		assert!(!submissions.is_empty(), "max-age guard never fired");
		assert!(submissions[0].payload_files.len() <= 61);
	}

	#[tokio::test(start_paused = true)]
	async fn closed_key_reopens_as_new_bucket() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		events
			.send(event(&config, "1.1", "study-1", "PAT-1"))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(6)).await;

		events
			.send(event(&config, "1.2", "study-1", "PAT-1"))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(6)).await;

		let submissions = sink.submissions();
		assert_eq!(submissions.len(), 2);
		assert_eq!(submissions[0].payload_files.len(), 1);
		assert_eq!(submissions[1].payload_files.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn transient_submit_failures_are_retried() {
		let sink = RecordingSink::failing(2, false);
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		events
			.send(event(&config, "1.1", "study-1", "PAT-1"))
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(sink.submissions().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn permanent_submit_failure_is_not_retried() {
		let sink = RecordingSink::failing(1, true);
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::StudyInstanceUid, &["pipe-1"]);

		events
			.send(event(&config, "1.1", "study-1", "PAT-1"))
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_secs(120)).await;
		assert!(sink.submissions().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn grouping_none_opens_one_bucket_per_instance() {
		let sink = RecordingSink::new();
		let (events, _shutdown) = run_engine(Arc::clone(&sink)).await;
		let config = config(GroupingKind::None, &["pipe-1"]);

		for sop in ["1.1", "1.2", "1.3"] {
			events
				.send(event(&config, sop, "study-1", "PAT-1"))
				.await
				.unwrap();
		}

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(sink.submissions().len(), 3);
	}
}
