//! Reconciliation counters
//!
//! Shared by every jar of a service. Counters are relaxed atomics: they are
//! read for diagnostics only and never drive decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct SyncMetrics {
	applied: AtomicU64,
	drained: AtomicU64,
	queued: AtomicU64,
	queue_full: AtomicU64,
	duplicates: AtomicU64,
	queue_conflicts: AtomicU64,
	superseded: AtomicU64,
	halted_discards: AtomicU64,
	verification_failures: AtomicU64,
	apply_failures: AtomicU64,
	halts: AtomicU64,
	backfill_requests: AtomicU64,
	backfill_empty: AtomicU64,
	backfill_partial: AtomicU64,
	backfill_complete: AtomicU64,
	backfill_skipped: AtomicU64,
	backfill_failures: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetricsSnapshot {
	pub applied: u64,
	/// Applies that came out of the pending queue, a subset of `applied`
	pub drained: u64,
	pub queued: u64,
	pub queue_full: u64,
	pub duplicates: u64,
	/// Envelopes refused because another content ID is queued at their sequence
	pub queue_conflicts: u64,
	pub superseded: u64,
	pub halted_discards: u64,
	pub verification_failures: u64,
	pub apply_failures: u64,
	pub halts: u64,
	pub backfill_requests: u64,
	pub backfill_empty: u64,
	pub backfill_partial: u64,
	pub backfill_complete: u64,
	pub backfill_skipped: u64,
	pub backfill_failures: u64,
}

fn bump(counter: &AtomicU64) {
	counter.fetch_add(1, Ordering::Relaxed);
}

impl SyncMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_applied(&self, from_queue: bool) {
		bump(&self.applied);
		if from_queue {
			bump(&self.drained);
		}
	}

	pub fn record_queued(&self) {
		bump(&self.queued);
	}

	pub fn record_queue_full(&self) {
		bump(&self.queue_full);
	}

	pub fn record_duplicate(&self) {
		bump(&self.duplicates);
	}

	pub fn record_queue_conflict(&self) {
		bump(&self.queue_conflicts);
	}

	pub fn record_superseded(&self) {
		bump(&self.superseded);
	}

	pub fn record_halted_discard(&self) {
		bump(&self.halted_discards);
	}

	pub fn record_verification_failure(&self) {
		bump(&self.verification_failures);
	}

	pub fn record_apply_failure(&self) {
		bump(&self.apply_failures);
	}

	pub fn record_halt(&self) {
		bump(&self.halts);
	}

	pub fn record_backfill_request(&self) {
		bump(&self.backfill_requests);
	}

	/// Classifies a finished request by how much of the range came back.
	pub fn record_backfill_result(&self, returned: u64, requested: u64) {
		if returned == 0 {
			bump(&self.backfill_empty);
		} else if returned < requested {
			bump(&self.backfill_partial);
		} else {
			bump(&self.backfill_complete);
		}
	}

	pub fn record_backfill_skipped(&self) {
		bump(&self.backfill_skipped);
	}

	pub fn record_backfill_failure(&self) {
		bump(&self.backfill_failures);
	}

	pub fn snapshot(&self) -> SyncMetricsSnapshot {
		let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

		SyncMetricsSnapshot {
			applied: load(&self.applied),
			drained: load(&self.drained),
			queued: load(&self.queued),
			queue_full: load(&self.queue_full),
			duplicates: load(&self.duplicates),
			queue_conflicts: load(&self.queue_conflicts),
			superseded: load(&self.superseded),
			halted_discards: load(&self.halted_discards),
			verification_failures: load(&self.verification_failures),
			apply_failures: load(&self.apply_failures),
			halts: load(&self.halts),
			backfill_requests: load(&self.backfill_requests),
			backfill_empty: load(&self.backfill_empty),
			backfill_partial: load(&self.backfill_partial),
			backfill_complete: load(&self.backfill_complete),
			backfill_skipped: load(&self.backfill_skipped),
			backfill_failures: load(&self.backfill_failures),
		}
	}
}
