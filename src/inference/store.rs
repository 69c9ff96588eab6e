use crate::inference::{
	InferenceRequest, RequestState, RequestStatus, ValidationError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use uuid::Uuid;

const REQUESTS_TREE: &str = "inference_requests";
const QUEUE_TREE: &str = "request_queue";
const SNAPSHOTS_TREE: &str = "state_snapshots";

/// Durable FIFO queue of inference requests with random-access update.
///
/// Requests live in the `inference_requests` tree keyed by id; FIFO order
/// comes from the `request_queue` tree keyed by a monotonic sequence
/// number. Every transition also writes a compact entry to
/// `state_snapshots`. Writes are flushed before the call returns, so an
/// acknowledged request survives a crash.
pub struct RequestStore {
	db: sled::Db,
	requests: sled::Tree,
	queue: sled::Tree,
	snapshots: sled::Tree,
	/// Serializes `claim_next` so at most one caller claims a request.
	claim: Mutex<()>,
	notify: Notify,
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Db(#[from] sled::Error),
	#[error("Failed to encode or decode a record: {0}")]
	Codec(#[from] bincode::Error),
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error("Inference request {0} does not exist")]
	NotFound(Uuid),
	#[error("Inference request {0}: storage path is assigned at most once")]
	StoragePathImmutable(Uuid),
	#[error("Inference request {0}: try count must not decrease")]
	TryCountDecreased(Uuid),
}

/// Compact state history entry, one per transition.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
	pub state: RequestState,
	pub status: RequestStatus,
	pub try_count: u32,
	pub updated_at: DateTime<Utc>,
}

impl RequestStore {
	pub fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
		let db = sled::open(path)?;
		let requests = db.open_tree(REQUESTS_TREE)?;
		let queue = db.open_tree(QUEUE_TREE)?;
		let snapshots = db.open_tree(SNAPSHOTS_TREE)?;

		info!(path = %path.display(), pending = queue.len(), "Opened inference request store");

		Ok(Arc::new(Self {
			db,
			requests,
			queue,
			snapshots,
			claim: Mutex::new(()),
			notify: Notify::new(),
		}))
	}

	/// Validates and persists a new request. The write is flushed before
	/// the id is returned to the caller.
	pub fn enqueue(&self, mut request: InferenceRequest) -> Result<Uuid, StoreError> {
		request.validate()?;

		request.state = RequestState::Queued;
		request.status = RequestStatus::Unknown;
		request.updated_at = Utc::now();

		let id = request.inference_request_id;
		self.put(&request)?;
		self.push_queue_entry(id)?;
		self.flush()?;

		info!(
			inference_request_id = id.to_string(),
			transaction_id = request.transaction_id,
			"Enqueued inference request"
		);
		self.notify.notify_one();
		Ok(id)
	}

	/// Claims the oldest due queued request, marking it in-process.
	/// Serialized across callers: a request is handed to at most one
	/// worker at a time.
	pub async fn claim_next(&self) -> Result<Option<InferenceRequest>, StoreError> {
		let _guard = self.claim.lock().await;
		let now = Utc::now();

		for entry in self.queue.iter() {
			let (seq, id_bytes) = entry?;
			let Some(id) = Uuid::from_slice(&id_bytes).ok() else {
				self.queue.remove(seq)?;
				continue;
			};

			let Some(mut request) = self.load(id)? else {
				// The queue entry outlived its record.
				self.queue.remove(seq)?;
				continue;
			};

			if request.state != RequestState::Queued {
				// Stale entry from a re-queue; the live entry follows.
				self.queue.remove(seq)?;
				continue;
			}

			if request
				.not_before
				.is_some_and(|not_before| not_before > now)
			{
				continue;
			}

			request.state = RequestState::InProcess;
			request.not_before = None;
			request.updated_at = now;
			self.queue.remove(seq)?;
			self.put(&request)?;
			self.flush()?;
			return Ok(Some(request));
		}

		Ok(None)
	}

	/// Persists an updated request, enforcing the invariants that
	/// `storage_path` is assigned at most once and `try_count` never
	/// decreases. A request updated back to `Queued` is appended to the
	/// queue again.
	pub fn update(&self, mut request: InferenceRequest) -> Result<(), StoreError> {
		let id = request.inference_request_id;
		let existing = self.load(id)?.ok_or(StoreError::NotFound(id))?;

		if existing
			.storage_path
			.as_ref()
			.is_some_and(|path| request.storage_path.as_ref() != Some(path))
		{
			return Err(StoreError::StoragePathImmutable(id));
		}
		if request.try_count < existing.try_count {
			return Err(StoreError::TryCountDecreased(id));
		}

		request.updated_at = Utc::now();
		self.put(&request)?;
		if request.state == RequestState::Queued {
			self.push_queue_entry(id)?;
			self.notify.notify_one();
		}
		self.flush()?;
		Ok(())
	}

	pub fn get(&self, id: Uuid) -> Result<Option<InferenceRequest>, StoreError> {
		self.load(id)
	}

	/// Latest state snapshot of a request.
	pub fn snapshot(&self, id: Uuid) -> Result<Option<StateSnapshot>, StoreError> {
		let Some(bytes) = self.snapshots.get(id.as_bytes())? else {
			return Ok(None);
		};
		Ok(Some(bincode::deserialize(&bytes)?))
	}

	/// All requests currently in the given state.
	pub fn by_state(&self, state: RequestState) -> Result<Vec<InferenceRequest>, StoreError> {
		let mut matching = Vec::new();
		for entry in self.requests.iter() {
			let (_, bytes) = entry?;
			let request: InferenceRequest = bincode::deserialize(&bytes)?;
			if request.state == state {
				matching.push(request);
			}
		}
		Ok(matching)
	}

	/// Cancels a request. A queued request completes immediately with
	/// status Fail; an in-process request is flagged and honored by the
	/// worker at the next resource boundary. Completed requests are left
	/// untouched.
	pub fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
		let Some(mut request) = self.load(id)? else {
			return Err(StoreError::NotFound(id));
		};

		match request.state {
			RequestState::Queued => {
				request.state = RequestState::Completed;
				request.status = RequestStatus::Fail;
				request
					.errors
					.push(String::from("cancelled before processing"));
				request.updated_at = Utc::now();
				self.put(&request)?;
				self.flush()?;
				Ok(true)
			}
			RequestState::InProcess => {
				request.cancel_requested = true;
				request.updated_at = Utc::now();
				self.put(&request)?;
				self.flush()?;
				Ok(true)
			}
			RequestState::Completed => Ok(false),
		}
	}

	/// Restart recovery: requests left in-process by a previous run are
	/// reset to queued with an incremented try count.
	pub fn recover_inflight(&self) -> Result<usize, StoreError> {
		let mut recovered = 0;
		for request in self.by_state(RequestState::InProcess)? {
			let mut request = request;
			request.state = RequestState::Queued;
			request.try_count += 1;
			request.updated_at = Utc::now();
			self.put(&request)?;
			self.push_queue_entry(request.inference_request_id)?;
			recovered += 1;
		}
		if recovered > 0 {
			self.flush()?;
			warn!(recovered, "Reset in-process requests from previous run");
			self.notify.notify_one();
		}
		Ok(recovered)
	}

	/// Resolves when a request may have become claimable.
	pub async fn wait_for_work(&self) {
		self.notify.notified().await;
	}

	fn load(&self, id: Uuid) -> Result<Option<InferenceRequest>, StoreError> {
		let Some(bytes) = self.requests.get(id.as_bytes())? else {
			return Ok(None);
		};
		Ok(Some(bincode::deserialize(&bytes)?))
	}

	fn put(&self, request: &InferenceRequest) -> Result<(), StoreError> {
		let id = request.inference_request_id;
		self.requests
			.insert(id.as_bytes(), bincode::serialize(request)?)?;
		let snapshot = StateSnapshot {
			state: request.state,
			status: request.status,
			try_count: request.try_count,
			updated_at: request.updated_at,
		};
		self.snapshots
			.insert(id.as_bytes(), bincode::serialize(&snapshot)?)?;
		Ok(())
	}

	fn push_queue_entry(&self, id: Uuid) -> Result<(), StoreError> {
		let seq = self.db.generate_id()?;
		self.queue.insert(seq.to_be_bytes(), id.as_bytes().to_vec())?;
		Ok(())
	}

	fn flush(&self) -> Result<(), StoreError> {
		self.db.flush()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::inference::fixtures::valid_request;
	use tempfile::tempdir;

	fn open_store(dir: &tempfile::TempDir) -> Arc<RequestStore> {
		RequestStore::open(&dir.path().join("db")).unwrap()
	}

	#[tokio::test]
	async fn enqueue_claim_round_trip() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		let id = store.enqueue(valid_request()).unwrap();
		let claimed = store.claim_next().await.unwrap().unwrap();

		assert_eq!(claimed.inference_request_id, id);
		assert_eq!(claimed.state, RequestState::InProcess);
		assert!(store.claim_next().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn claims_in_fifo_order() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		let first = store.enqueue(valid_request()).unwrap();
		let second = store.enqueue(valid_request()).unwrap();

		assert_eq!(
			store.claim_next().await.unwrap().unwrap().inference_request_id,
			first
		);
		assert_eq!(
			store.claim_next().await.unwrap().unwrap().inference_request_id,
			second
		);
	}

	#[test]
	fn invalid_request_is_rejected_with_details() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		let mut request = valid_request();
		request.transaction_id = String::new();
		let err = store.enqueue(request).unwrap_err();
		assert!(matches!(err, StoreError::Validation(_)));
	}

	#[tokio::test]
	async fn requeued_request_respects_not_before() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		store.enqueue(valid_request()).unwrap();
		let mut claimed = store.claim_next().await.unwrap().unwrap();

		claimed.state = RequestState::Queued;
		claimed.try_count += 1;
		claimed.not_before = Some(Utc::now() + chrono::Duration::hours(1));
		store.update(claimed).unwrap();

		assert!(store.claim_next().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn storage_path_is_immutable_once_set() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		store.enqueue(valid_request()).unwrap();
		let mut claimed = store.claim_next().await.unwrap().unwrap();

		claimed.storage_path = Some(std::path::PathBuf::from("/staging/request-1"));
		store.update(claimed.clone()).unwrap();

		claimed.storage_path = Some(std::path::PathBuf::from("/staging/other"));
		let err = store.update(claimed.clone()).unwrap_err();
		assert!(matches!(err, StoreError::StoragePathImmutable(_)));

		claimed.storage_path = None;
		let err = store.update(claimed).unwrap_err();
		assert!(matches!(err, StoreError::StoragePathImmutable(_)));
	}

	#[tokio::test]
	async fn try_count_must_not_decrease() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		store.enqueue(valid_request()).unwrap();
		let mut claimed = store.claim_next().await.unwrap().unwrap();
		claimed.try_count = 2;
		store.update(claimed.clone()).unwrap();

		claimed.try_count = 1;
		let err = store.update(claimed).unwrap_err();
		assert!(matches!(err, StoreError::TryCountDecreased(_)));
	}

	#[tokio::test]
	async fn recovery_resets_inflight_requests() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("db");

		let id = {
			let store = RequestStore::open(&path).unwrap();
			let id = store.enqueue(valid_request()).unwrap();
			let _ = store.claim_next().await.unwrap().unwrap();
			id
		};

		// Simulated restart: the request was left InProcess.
		let store = RequestStore::open(&path).unwrap();
		assert_eq!(store.recover_inflight().unwrap(), 1);

		let recovered = store.get(id).unwrap().unwrap();
		assert_eq!(recovered.state, RequestState::Queued);
		assert_eq!(recovered.try_count, 1);
		assert!(store.claim_next().await.unwrap().is_some());
	}

	#[tokio::test]
	async fn cancel_queued_completes_with_fail() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		let id = store.enqueue(valid_request()).unwrap();
		assert!(store.cancel(id).unwrap());

		let cancelled = store.get(id).unwrap().unwrap();
		assert_eq!(cancelled.state, RequestState::Completed);
		assert_eq!(cancelled.status, RequestStatus::Fail);
		assert!(store.claim_next().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn cancel_inprocess_sets_flag() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		let id = store.enqueue(valid_request()).unwrap();
		let _ = store.claim_next().await.unwrap().unwrap();
		assert!(store.cancel(id).unwrap());

		let flagged = store.get(id).unwrap().unwrap();
		assert_eq!(flagged.state, RequestState::InProcess);
		assert!(flagged.cancel_requested);
	}

	#[tokio::test]
	async fn by_state_scans_records() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		store.enqueue(valid_request()).unwrap();
		store.enqueue(valid_request()).unwrap();
		let _ = store.claim_next().await.unwrap();

		assert_eq!(store.by_state(RequestState::Queued).unwrap().len(), 1);
		assert_eq!(store.by_state(RequestState::InProcess).unwrap().len(), 1);
	}

	#[tokio::test]
	async fn snapshots_track_transitions() {
		let dir = tempdir().unwrap();
		let store = open_store(&dir);

		let id = store.enqueue(valid_request()).unwrap();
		let snapshot = store.snapshot(id).unwrap().unwrap();
		assert_eq!(snapshot.state, RequestState::Queued);

		let _ = store.claim_next().await.unwrap().unwrap();
		let snapshot = store.snapshot(id).unwrap().unwrap();
		assert_eq!(snapshot.state, RequestState::InProcess);
		assert_eq!(snapshot.try_count, 0);
	}
}
