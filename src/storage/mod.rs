use crate::config::StorageConfig;
use crate::error::{Categorized, Category};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Staging storage: scoped temporary directories under a configured root.
///
/// Directories are unique per scope and never reused across scopes. A scope
/// ends either by explicit [`StagingStore::release`] or when the retention
/// reaper removes it, whichever comes first. Usage above the high-water
/// threshold makes [`StagingStore::acquire`] fail so the SCP can refuse
/// associations.
#[derive(Debug)]
pub struct StagingStore {
	root: PathBuf,
	high_water: u64,
	usage: AtomicU64,
	active: Mutex<HashSet<String>>,
}

/// Lease on one staging directory. Dropping the handle does not release the
/// scope; release is explicit because file ownership usually outlives the
/// task that created the scope.
#[derive(Debug, Clone)]
pub struct StagingHandle {
	scope: String,
	dir: PathBuf,
}

impl StagingHandle {
	pub fn scope(&self) -> &str {
		&self.scope
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn file_path(&self, name: &str) -> PathBuf {
		self.dir.join(name)
	}
}

#[derive(Debug, Error)]
pub enum StagingError {
	#[error("Staging usage {usage} exceeds high-water threshold {high_water}")]
	Full { usage: u64, high_water: u64 },
	#[error("Staging root is not writable: {0}")]
	RootUnavailable(std::io::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Categorized for StagingError {
	fn category(&self) -> Category {
		match self {
			Self::Full { .. } => Category::StagingFull,
			Self::RootUnavailable(_) | Self::Io(_) => Category::TransientIo,
		}
	}
}

impl StagingStore {
	pub fn new(config: &StorageConfig) -> Result<Arc<Self>, StagingError> {
		std::fs::create_dir_all(&config.staging_root).map_err(StagingError::RootUnavailable)?;
		let usage = directory_size(&config.staging_root).unwrap_or(0);

		info!(
			root = %config.staging_root.display(),
			usage,
			high_water = config.high_water_bytes,
			"Opened staging store"
		);

		Ok(Arc::new(Self {
			root: config.staging_root.clone(),
			high_water: config.high_water_bytes,
			usage: AtomicU64::new(usage),
			active: Mutex::new(HashSet::new()),
		}))
	}

	/// Fails with [`StagingError::Full`] when usage is above the high-water
	/// threshold, without touching the filesystem.
	pub fn check_pressure(&self) -> Result<(), StagingError> {
		let usage = self.usage.load(Ordering::Relaxed);
		if usage > self.high_water {
			return Err(StagingError::Full {
				usage,
				high_water: self.high_water,
			});
		}
		Ok(())
	}

	/// Returns a writable directory for the given scope. Re-acquiring an
	/// active scope returns the same directory, so a restarted worker finds
	/// its files again.
	pub fn acquire(&self, scope: &str) -> Result<StagingHandle, StagingError> {
		self.check_pressure()?;

		let dir = self.root.join(scope);
		std::fs::create_dir_all(&dir)?;
		self.active
			.lock()
			.expect("staging lock poisoned")
			.insert(String::from(scope));

		debug!(scope, dir = %dir.display(), "Acquired staging scope");
		Ok(StagingHandle {
			scope: String::from(scope),
			dir,
		})
	}

	/// Ends the scope. Files stay on disk until the retention reaper
	/// removes the directory.
	pub fn release(&self, handle: &StagingHandle) {
		self.active
			.lock()
			.expect("staging lock poisoned")
			.remove(&handle.scope);
		debug!(scope = handle.scope, "Released staging scope");
	}

	/// Accounts bytes written into a staging directory.
	pub fn record_usage(&self, bytes: u64) {
		self.usage.fetch_add(bytes, Ordering::Relaxed);
	}

	fn is_active(&self, scope: &str) -> bool {
		self.active
			.lock()
			.expect("staging lock poisoned")
			.contains(scope)
	}

	/// Background reaper: removes released scope directories older than the
	/// retention window and refreshes the usage counter.
	pub async fn reap(self: Arc<Self>, config: StorageConfig, shutdown: CancellationToken) {
		let mut interval = tokio::time::interval(config.sweep_interval());
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = interval.tick() => {}
			}

			let store = Arc::clone(&self);
			let retention = config.retention();
			let result = tokio::task::spawn_blocking(move || store.sweep(retention)).await;
			match result {
				Ok(Ok(removed)) if removed > 0 => {
					info!(removed, "Reaped expired staging scopes");
				}
				Ok(Ok(_)) => {}
				Ok(Err(err)) => warn!("Staging sweep failed: {err}"),
				Err(err) => warn!("Staging sweep panicked: {err}"),
			}
		}
	}

	fn sweep(&self, retention: std::time::Duration) -> Result<usize, StagingError> {
		let now = SystemTime::now();
		let mut removed = 0;

		for entry in std::fs::read_dir(&self.root)? {
			let entry = entry?;
			if !entry.file_type()?.is_dir() {
				continue;
			}
			let scope = entry.file_name().to_string_lossy().into_owned();
			if self.is_active(&scope) {
				continue;
			}
			let age = entry
				.metadata()?
				.modified()
				.ok()
				.and_then(|modified| now.duration_since(modified).ok());
			if age.is_some_and(|age| age > retention) {
				std::fs::remove_dir_all(entry.path())?;
				removed += 1;
			}
		}

		self.usage
			.store(directory_size(&self.root)?, Ordering::Relaxed);
		Ok(removed)
	}
}

fn directory_size(path: &Path) -> Result<u64, std::io::Error> {
	let mut total = 0;
	for entry in std::fs::read_dir(path)? {
		let entry = entry?;
		let metadata = entry.metadata()?;
		if metadata.is_dir() {
			total += directory_size(&entry.path())?;
		} else {
			total += metadata.len();
		}
	}
	Ok(total)
}
