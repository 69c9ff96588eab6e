use crate::types::{AE, UI, US};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Sender;
use tracing::debug;

/// Identity of one in-flight retrieval, matched against the move
/// originator attributes of incoming C-STORE sub-operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
	/// The sub-operation carries Move Originator AE Title and Message ID.
	Identified { originator: AE, message_id: US },
	/// Fallback for peers that omit the originator attributes: match by
	/// the calling AE of the association delivering the sub-operations.
	Unidentified { originator: AE },
}

impl RouteKey {
	pub const fn new(originator: AE, message_id: Option<US>) -> Self {
		match message_id {
			None => Self::Unidentified { originator },
			Some(message_id) => Self::Identified {
				originator,
				message_id,
			},
		}
	}
}

/// Where claimed instances are written, and who gets told about them.
#[derive(Debug, Clone)]
pub struct InstanceSink {
	pub dir: PathBuf,
	/// Receives the SOP instance UID of every deposited file.
	pub deposited: Sender<UI>,
}

/// Routes C-MOVE sub-operations arriving at the store SCP to the retrieval
/// that requested them, keeping them out of the ingest/grouping path.
#[derive(Debug, Default, Clone)]
pub struct RetrieveRouter {
	sinks: Arc<Mutex<HashMap<RouteKey, InstanceSink>>>,
}

/// Deregisters its keys when dropped, so an aborted retrieval does not
/// leave stale claims behind.
pub struct RouteRegistration {
	router: RetrieveRouter,
	keys: Vec<RouteKey>,
}

impl Drop for RouteRegistration {
	fn drop(&mut self) {
		let mut sinks = self.router.sinks.lock().expect("router lock poisoned");
		for key in &self.keys {
			sinks.remove(key);
		}
	}
}

impl RetrieveRouter {
	#[must_use]
	pub fn register(&self, keys: Vec<RouteKey>, sink: InstanceSink) -> RouteRegistration {
		let mut sinks = self.sinks.lock().expect("router lock poisoned");
		for key in &keys {
			debug!(?key, dir = %sink.dir.display(), "Registered retrieve route");
			sinks.insert(key.clone(), sink.clone());
		}
		RouteRegistration {
			router: self.clone(),
			keys,
		}
	}

	/// Resolves the sink for an incoming sub-operation, preferring an
	/// identified match over the calling-AE fallback.
	pub fn resolve(
		&self,
		calling_aet: &str,
		originator_aet: Option<&str>,
		originator_message_id: Option<US>,
	) -> Option<InstanceSink> {
		let sinks = self.sinks.lock().expect("router lock poisoned");

		if let (Some(originator), Some(message_id)) = (originator_aet, originator_message_id) {
			let key = RouteKey::Identified {
				originator: AE::from(originator),
				message_id,
			};
			if let Some(sink) = sinks.get(&key) {
				return Some(sink.clone());
			}
		}

		sinks
			.get(&RouteKey::Unidentified {
				originator: AE::from(calling_aet),
			})
			.cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::mpsc;

	#[test]
	fn resolves_identified_before_fallback() {
		let router = RetrieveRouter::default();
		let (tx_a, _rx_a) = mpsc::channel(1);
		let (tx_b, _rx_b) = mpsc::channel(1);

		let _a = router.register(
			vec![RouteKey::new(AE::from("BRIDGE"), Some(7))],
			InstanceSink {
				dir: PathBuf::from("/tmp/a"),
				deposited: tx_a,
			},
		);
		let _b = router.register(
			vec![RouteKey::new(AE::from("PACS1"), None)],
			InstanceSink {
				dir: PathBuf::from("/tmp/b"),
				deposited: tx_b,
			},
		);

		let identified = router.resolve("PACS1", Some("BRIDGE"), Some(7)).unwrap();
		assert_eq!(identified.dir, PathBuf::from("/tmp/a"));

		let fallback = router.resolve("PACS1", None, None).unwrap();
		assert_eq!(fallback.dir, PathBuf::from("/tmp/b"));
	}

	#[test]
	fn registration_drop_removes_routes() {
		let router = RetrieveRouter::default();
		let (tx, _rx) = mpsc::channel(1);

		{
			let _registration = router.register(
				vec![RouteKey::new(AE::from("BRIDGE"), Some(1))],
				InstanceSink {
					dir: PathBuf::from("/tmp/x"),
					deposited: tx,
				},
			);
			assert!(router.resolve("PACS1", Some("BRIDGE"), Some(1)).is_some());
		}

		assert!(router.resolve("PACS1", Some("BRIDGE"), Some(1)).is_none());
	}

	#[test]
	fn unrelated_store_is_not_claimed() {
		let router = RetrieveRouter::default();
		assert!(router.resolve("PACS1", None, None).is_none());
		assert!(router.resolve("PACS1", Some("BRIDGE"), Some(9)).is_none());
	}
}
