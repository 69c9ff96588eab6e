use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Commands accepted by the deadline scheduler.
#[derive(Debug)]
pub enum TimerCommand<K> {
	/// Creates or moves the deadline entry for a key. Re-arming an existing
	/// key replaces its deadline, which is how sliding quiet periods avoid
	/// one timer per event.
	Arm {
		key: K,
		epoch: u64,
		deadline: Instant,
	},
	Cancel {
		key: K,
	},
}

/// Emitted when a key's deadline elapses without being re-armed.
#[derive(Debug, PartialEq, Eq)]
pub struct Expired<K> {
	pub key: K,
	pub epoch: u64,
}

struct HeapEntry<K> {
	deadline: Instant,
	key: K,
	epoch: u64,
}

impl<K> PartialEq for HeapEntry<K> {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline
	}
}
impl<K> Eq for HeapEntry<K> {}
impl<K> PartialOrd for HeapEntry<K> {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl<K> Ord for HeapEntry<K> {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.deadline.cmp(&other.deadline)
	}
}

/// Single-task scheduler holding one deadline per key.
///
/// Deadlines live in a hash map; the binary heap only orders candidate
/// wake-ups and may contain stale entries, which are discarded lazily by
/// comparing against the map (deadline and epoch must still match).
pub struct DeadlineScheduler;

impl DeadlineScheduler {
	pub async fn run<K>(
		mut commands: mpsc::Receiver<TimerCommand<K>>,
		expired: mpsc::Sender<Expired<K>>,
		shutdown: CancellationToken,
	) where
		K: Clone + Eq + Hash + Send + std::fmt::Debug,
	{
		let mut entries: HashMap<K, (Instant, u64)> = HashMap::new();
		let mut heap: BinaryHeap<Reverse<HeapEntry<K>>> = BinaryHeap::new();

		loop {
			// Discard heap entries that no longer reflect the armed state.
			while let Some(Reverse(candidate)) = heap.peek() {
				let current = entries.get(&candidate.key);
				let stale = !matches!(
					current,
					Some((deadline, epoch))
						if *deadline == candidate.deadline && *epoch == candidate.epoch
				);
				if stale {
					heap.pop();
				} else {
					break;
				}
			}

			let next_deadline = heap.peek().map(|Reverse(entry)| entry.deadline);

			tokio::select! {
				() = shutdown.cancelled() => break,
				command = commands.recv() => match command {
					None => break,
					Some(TimerCommand::Arm { key, epoch, deadline }) => {
						entries.insert(key.clone(), (deadline, epoch));
						heap.push(Reverse(HeapEntry { deadline, key, epoch }));
					}
					Some(TimerCommand::Cancel { key }) => {
						entries.remove(&key);
					}
				},
				() = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
					if next_deadline.is_some() =>
				{
					let Some(Reverse(entry)) = heap.pop() else { continue };
					entries.remove(&entry.key);
					debug!(key = ?entry.key, "Deadline expired");
					if expired
						.send(Expired { key: entry.key, epoch: entry.epoch })
						.await
						.is_err()
					{
						break;
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn spawn_scheduler() -> (
		mpsc::Sender<TimerCommand<&'static str>>,
		mpsc::Receiver<Expired<&'static str>>,
		CancellationToken,
	) {
		let (command_tx, command_rx) = mpsc::channel(16);
		let (expired_tx, expired_rx) = mpsc::channel(16);
		let shutdown = CancellationToken::new();
		tokio::spawn(DeadlineScheduler::run(
			command_rx,
			expired_tx,
			shutdown.clone(),
		));
		(command_tx, expired_rx, shutdown)
	}

	#[tokio::test(start_paused = true)]
	async fn fires_after_deadline() {
		let (commands, mut expired, _shutdown) = spawn_scheduler();

		let armed_at = Instant::now();
		commands
			.send(TimerCommand::Arm {
				key: "a",
				epoch: 1,
				deadline: armed_at + Duration::from_secs(5),
			})
			.await
			.unwrap();

		let fired = expired.recv().await.unwrap();
		assert_eq!(fired, Expired { key: "a", epoch: 1 });
		assert!(armed_at.elapsed() >= Duration::from_secs(5));
	}

	#[tokio::test(start_paused = true)]
	async fn rearming_slides_the_deadline() {
		let (commands, mut expired, _shutdown) = spawn_scheduler();

		commands
			.send(TimerCommand::Arm {
				key: "a",
				epoch: 1,
				deadline: Instant::now() + Duration::from_secs(5),
			})
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(3)).await;
		commands
			.send(TimerCommand::Arm {
				key: "a",
				epoch: 1,
				deadline: Instant::now() + Duration::from_secs(5),
			})
			.await
			.unwrap();

		let before = Instant::now();
		let fired = expired.recv().await.unwrap();
		assert_eq!(fired.key, "a");
		// The original 5s deadline was replaced; the expiry happens 5s
		// after the re-arm, not 2s.
		assert!(before.elapsed() >= Duration::from_secs(4));
	}

	#[tokio::test(start_paused = true)]
	async fn cancel_prevents_expiry() {
		let (commands, mut expired, _shutdown) = spawn_scheduler();

		commands
			.send(TimerCommand::Arm {
				key: "a",
				epoch: 1,
				deadline: Instant::now() + Duration::from_secs(1),
			})
			.await
			.unwrap();
		commands
			.send(TimerCommand::Cancel { key: "a" })
			.await
			.unwrap();
		commands
			.send(TimerCommand::Arm {
				key: "b",
				epoch: 7,
				deadline: Instant::now() + Duration::from_secs(2),
			})
			.await
			.unwrap();

		let fired = expired.recv().await.unwrap();
		assert_eq!(fired, Expired { key: "b", epoch: 7 });
	}
}
