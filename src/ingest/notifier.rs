use crate::config::CalledAeConfig;
use crate::ingest::Instance;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event published for every instance stored by the SCP.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
	pub instance: Arc<Instance>,
	/// Policy of the called AE the instance was addressed to.
	pub config: Arc<CalledAeConfig>,
}

/// In-process pub/sub for stored instances.
///
/// Observers subscribe once at startup and receive events in subscription
/// order over bounded channels; a dropped or full subscriber is isolated
/// from the publisher and from other observers. Per association, events
/// are published in file-write order.
#[derive(Debug)]
pub struct InstanceNotifier {
	capacity: usize,
	subscribers: Mutex<Vec<Subscription>>,
}

#[derive(Debug)]
struct Subscription {
	name: String,
	tx: mpsc::Sender<InstanceEvent>,
}

impl InstanceNotifier {
	pub fn new(capacity: usize) -> Arc<Self> {
		Arc::new(Self {
			capacity,
			subscribers: Mutex::new(Vec::new()),
		})
	}

	pub fn subscribe(&self, name: &str) -> mpsc::Receiver<InstanceEvent> {
		let (tx, rx) = mpsc::channel(self.capacity);
		let mut subscribers = self.subscribers.lock().expect("notifier lock poisoned");
		subscribers.push(Subscription {
			name: String::from(name),
			tx,
		});
		debug!(observer = name, "Added instance observer");
		rx
	}

	/// Delivers the event to every observer in subscription order and
	/// returns the number of successful deliveries. Failed deliveries are
	/// logged; the publisher never fails.
	pub async fn publish(&self, event: InstanceEvent) -> usize {
		let subscribers: Vec<(String, mpsc::Sender<InstanceEvent>)> = {
			let guard = self.subscribers.lock().expect("notifier lock poisoned");
			guard
				.iter()
				.map(|subscription| (subscription.name.clone(), subscription.tx.clone()))
				.collect()
		};

		let mut delivered = 0;
		for (name, tx) in subscribers {
			match tx.send(event.clone()).await {
				Ok(()) => delivered += 1,
				Err(err) => {
					warn!(
						observer = name,
						sop_instance_uid = event.instance.sop_instance_uid,
						"Failed to notify observer: {err}"
					);
				}
			}
		}
		delivered
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CalledAeConfig, GroupingKind};
	use chrono::Utc;
	use std::path::PathBuf;

	fn event(sop: &str) -> InstanceEvent {
		InstanceEvent {
			instance: Arc::new(Instance {
				sop_instance_uid: String::from(sop),
				series_instance_uid: String::from("1.2.3.1"),
				study_instance_uid: String::from("1.2.3"),
				patient_id: String::from("PAT-1"),
				called_ae: String::from("BRIDGE1"),
				calling_ae: String::from("PACS1"),
				received_at: Utc::now(),
				file_path: PathBuf::from(format!("/staging/x/{sop}.dcm")),
				transfer_syntax: String::from("1.2.840.10008.1.2.1"),
			}),
			config: Arc::new(CalledAeConfig {
				aet: String::from("BRIDGE1"),
				grouping: GroupingKind::StudyInstanceUid,
				timeout: 5_000,
				max_age: 60_000,
				allowed_sops: Vec::new(),
				allowed_sources: Vec::new(),
				pipelines: vec![String::from("pipeline-1")],
				priority: 128,
			}),
		}
	}

	#[tokio::test]
	async fn delivers_in_publish_order() {
		let notifier = InstanceNotifier::new(8);
		let mut rx = notifier.subscribe("grouping");

		for sop in ["1.1", "1.2", "1.3"] {
			assert_eq!(notifier.publish(event(sop)).await, 1);
		}

		assert_eq!(rx.recv().await.unwrap().instance.sop_instance_uid, "1.1");
		assert_eq!(rx.recv().await.unwrap().instance.sop_instance_uid, "1.2");
		assert_eq!(rx.recv().await.unwrap().instance.sop_instance_uid, "1.3");
	}

	#[tokio::test]
	async fn dropped_observer_is_isolated() {
		let notifier = InstanceNotifier::new(8);
		let dead = notifier.subscribe("dead");
		let mut live = notifier.subscribe("live");
		drop(dead);

		assert_eq!(notifier.publish(event("2.1")).await, 1);
		assert_eq!(live.recv().await.unwrap().instance.sop_instance_uid, "2.1");
	}
}
