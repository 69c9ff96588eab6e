//! Inbound side of the adapter: the store SCP accepting pushed instances
//! and the notifier fanning them out to the grouping engine.

pub mod notifier;
pub mod scp;

pub use notifier::{InstanceEvent, InstanceNotifier};
pub use scp::StoreServiceClassProvider;

use crate::types::{AE, UI};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// One received DICOM object, staged on the local filesystem.
///
/// The file is owned by the receiving association until notifier delivery
/// completes and stays in place until the enclosing bucket is claimed or
/// the retention deadline expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
	pub sop_instance_uid: UI,
	pub series_instance_uid: UI,
	pub study_instance_uid: UI,
	pub patient_id: String,
	pub called_ae: AE,
	pub calling_ae: AE,
	pub received_at: DateTime<Utc>,
	pub file_path: PathBuf,
	pub transfer_syntax: UI,
}
