use std::time::Duration;

/// Failure classes the adapter distinguishes when deciding how to react.
///
/// Transient classes are retried up to their budget; everything else is
/// surfaced to the caller or the request's final status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Category {
	/// Bad startup configuration. Fatal, the process refuses to start.
	ConfigInvalid,
	/// Unknown AE or disallowed source. Rejected at the DICOM layer.
	PolicyReject,
	/// Disk pressure in the staging store. New associations are refused.
	StagingFull,
	/// Filesystem hiccup or local network blip.
	TransientIo,
	/// Platform 5xx, retrieval timeout and similar remote conditions.
	TransientRemote,
	/// 4xx or malformed reply from a remote peer.
	PermanentRemote,
	/// Invalid inference request, refused at enqueue.
	ValidationFailed,
	/// External cancellation, honored at the next suspension point.
	Cancelled,
}

impl Category {
	pub const fn is_retryable(self) -> bool {
		matches!(self, Self::TransientIo | Self::TransientRemote)
	}
}

/// Errors that can report which failure class they belong to.
pub trait Categorized {
	fn category(&self) -> Category;
}

/// Exponential backoff schedule: `base * factor^attempt`, capped.
///
/// `delay(attempt)` returns `None` once the attempt budget is exhausted.
/// Attempts are zero-based.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
	pub base: Duration,
	pub factor: u32,
	pub cap: Duration,
	pub max_attempts: u32,
}

impl Backoff {
	/// Schedule used when submitting closed buckets to the platform.
	pub const SUBMIT: Self = Self {
		base: Duration::from_secs(1),
		factor: 2,
		cap: Duration::from_secs(60),
		max_attempts: 5,
	};

	pub fn delay(&self, attempt: u32) -> Option<Duration> {
		if attempt >= self.max_attempts {
			return None;
		}
		let exp = self.factor.saturating_pow(attempt);
		Some(self.base.saturating_mul(exp).min(self.cap))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn submit_backoff_schedule() {
		let backoff = Backoff::SUBMIT;
		assert_eq!(backoff.delay(0), Some(Duration::from_secs(1)));
		assert_eq!(backoff.delay(1), Some(Duration::from_secs(2)));
		assert_eq!(backoff.delay(2), Some(Duration::from_secs(4)));
		assert_eq!(backoff.delay(3), Some(Duration::from_secs(8)));
		assert_eq!(backoff.delay(4), Some(Duration::from_secs(16)));
		assert_eq!(backoff.delay(5), None);
	}

	#[test]
	fn backoff_caps_delay() {
		let backoff = Backoff {
			base: Duration::from_secs(1),
			factor: 2,
			cap: Duration::from_secs(60),
			max_attempts: 10,
		};
		assert_eq!(backoff.delay(9), Some(Duration::from_secs(60)));
	}

	#[test]
	fn retryable_categories() {
		assert!(Category::TransientIo.is_retryable());
		assert!(Category::TransientRemote.is_retryable());
		assert!(!Category::PermanentRemote.is_retryable());
		assert!(!Category::ValidationFailed.is_retryable());
		assert!(!Category::Cancelled.is_retryable());
	}
}
