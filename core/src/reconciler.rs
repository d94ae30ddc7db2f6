//! Per-jar reconstruction of the relay's total order
//!
//! A [`Reconciler`] owns one jar. Every envelope goes through [`Reconciler::process`],
//! which classifies it against the jar's durable state and either applies it,
//! parks it in the pending queue, or discards it. Applying an envelope drains
//! the queue as far as it is contiguous.
//!
//! The reconciler never talks to the relay and never calls itself: when it finds
//! a hole it reports the range in [`ProcessOutcome::gap`], and the
//! [`BackfillCoordinator`](crate::BackfillCoordinator) decides whether to fetch it.
//! Backfilled envelopes come back through [`Reconciler::ingest_backfill`] with
//! [`GapHandling::Suppress`].

use std::{
	collections::{HashSet, VecDeque},
	sync::Arc,
};

use jar_sync::{
	order_for_delivery, Envelope, JarId, QueueReason, SequenceRange, VerificationError, Verifier,
};
use sea_orm::DatabaseTransaction;
use serde::Serialize;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
	apply::{ApplyError, Applier},
	metrics::SyncMetrics,
	store::{
		EnqueueOutcome, PendingQueue, ProcessedLedger, RecordOutcome, SequenceState, SequenceStore,
		SyncStore,
	},
	Error, SyncConfig,
};

const SEQUENCE_CONTENT_MISMATCH: &str = "sequence/content mismatch";

/// Whether an envelope ahead of the expected sequence reports the hole below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapHandling {
	/// Normal delivery: queue envelopes from the future and report the gap
	Detect,
	/// Drain and backfill re-injection: never report a gap for the envelope
	/// itself, only the one left behind by a stalled drain
	Suppress,
}

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Disposition {
	/// Applied, followed by `drained` applies out of the pending queue
	Applied { drained: u64 },
	Queued,
	/// Pending queue at capacity, dropped until it is delivered again
	QueueFull,
	/// Already applied or already queued
	Duplicate,
	/// Another envelope is queued for this sequence and was kept; whichever
	/// one the relay really sequenced there surfaces when it is applied
	QueueConflict { queued_content_id: String },
	/// Below the next expected sequence
	Superseded,
	/// The jar is halted, nothing is applied until it is resumed
	Halted,
	Rejected(VerificationError),
	ApplyFailed(ApplyError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
	pub disposition: Disposition,
	/// Range to backfill, if one is known missing
	pub gap: Option<SequenceRange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
	pub applied: u64,
	pub gap: Option<SequenceRange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillIngest {
	pub applied: u64,
	pub gap: Option<SequenceRange>,
}

enum ApplyStep {
	Written,
	Failed(ApplyError),
	SequenceTaken(String),
	ContentTaken(u64),
}

/// Digests of envelopes that passed verification, oldest evicted first.
#[derive(Debug)]
struct VerifiedCache {
	capacity: usize,
	digests: HashSet<[u8; 32]>,
	order: VecDeque<[u8; 32]>,
}

impl VerifiedCache {
	fn new(capacity: usize) -> Self {
		Self {
			capacity,
			digests: HashSet::with_capacity(capacity),
			order: VecDeque::with_capacity(capacity),
		}
	}

	fn contains(&self, digest: &[u8; 32]) -> bool {
		self.digests.contains(digest)
	}

	fn insert(&mut self, digest: [u8; 32]) {
		if self.capacity == 0 || !self.digests.insert(digest) {
			return;
		}

		self.order.push_back(digest);
		while self.order.len() > self.capacity {
			if let Some(oldest) = self.order.pop_front() {
				self.digests.remove(&oldest);
			}
		}
	}

	fn remove(&mut self, digest: &[u8; 32]) {
		if self.digests.remove(digest) {
			self.order.retain(|kept| kept != digest);
		}
	}

	fn clear(&mut self) {
		self.digests.clear();
		self.order.clear();
	}
}

/// The only writer of a jar's sequence state.
///
/// Callers must serialize access per jar (the service keeps each reconciler
/// behind a mutex); different jars share nothing but the database. Other
/// instances over the same store may still move the jar: the persisted
/// sequence state is re-read before each envelope, drain and gap check.
pub struct Reconciler {
	jar_id: JarId,
	store: SyncStore,
	verifier: Arc<dyn Verifier>,
	applier: Arc<dyn Applier>,
	ledger: ProcessedLedger,
	pending: PendingQueue,
	sequence: SequenceStore,
	state: SequenceState,
	verified: VerifiedCache,
	max_pending: usize,
	metrics: Arc<SyncMetrics>,
}

impl std::fmt::Debug for Reconciler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reconciler")
			.field("jar_id", &self.jar_id)
			.field("state", &self.state)
			.field("max_pending", &self.max_pending)
			.finish_non_exhaustive()
	}
}

impl Reconciler {
	/// Loads the jar's durable state, creating it on first use.
	///
	/// Queued envelopes at or below the last applied sequence are dropped. A
	/// ledger that does not end where the sequence state says halts the jar.
	pub async fn load(
		jar_id: JarId,
		store: SyncStore,
		verifier: Arc<dyn Verifier>,
		applier: Arc<dyn Applier>,
		config: &SyncConfig,
		metrics: Arc<SyncMetrics>,
	) -> Result<Self, Error> {
		let sequence = SequenceStore::new(jar_id);
		let ledger = ProcessedLedger::new(jar_id);
		let pending = PendingQueue::new(jar_id);

		let state = sequence.load_or_init(store.conn()).await?;

		let mut reconciler = Self {
			jar_id,
			store,
			verifier,
			applier,
			ledger,
			pending,
			sequence,
			state,
			verified: VerifiedCache::new(config.verified_cache_size),
			max_pending: config.max_pending_per_jar,
			metrics,
		};

		let last_applied = reconciler.state.last_applied_sequence();
		let highest = reconciler.ledger.highest_sequence(reconciler.store.conn()).await?;
		if highest != last_applied && !reconciler.state.is_halted() {
			reconciler
				.halt(format!(
					"ledger ends at sequence {highest} but sequence state is at {last_applied}"
				))
				.await?;
		}

		let pruned = reconciler
			.pending
			.prune_through(reconciler.store.conn(), last_applied)
			.await?;
		if pruned > 0 {
			debug!(%jar_id, pruned, "Dropped stale queued envelopes");
		}

		debug!(
			%jar_id,
			last_applied,
			halted = reconciler.state.is_halted(),
			"Loaded reconciler"
		);

		Ok(reconciler)
	}

	pub const fn jar_id(&self) -> JarId {
		self.jar_id
	}

	pub const fn state(&self) -> &SequenceState {
		&self.state
	}

	pub const fn is_halted(&self) -> bool {
		self.state.is_halted()
	}

	pub const fn ledger(&self) -> &ProcessedLedger {
		&self.ledger
	}

	pub const fn pending(&self) -> &PendingQueue {
		&self.pending
	}

	/// Classifies one envelope and, if it was applied, drains the queue behind it.
	///
	/// Only corruption and storage failures are errors. Everything else,
	/// including verification and apply failures, is a [`Disposition`].
	#[instrument(
		skip_all,
		fields(jar_id = %self.jar_id, sequence = envelope.sequence, content_id = %envelope.content_id),
		err
	)]
	pub async fn process(
		&mut self,
		envelope: &Envelope,
		handling: GapHandling,
	) -> Result<ProcessOutcome, Error> {
		let (disposition, gap) = self.admit(envelope, handling, false).await?;

		if !matches!(disposition, Disposition::Applied { .. }) {
			return Ok(ProcessOutcome { disposition, gap });
		}

		let drained = self.drain().await?;

		Ok(ProcessOutcome {
			disposition: Disposition::Applied {
				drained: drained.applied,
			},
			gap: drained.gap,
		})
	}

	/// Applies queued envelopes while the queue head is the expected sequence.
	///
	/// Makes at most one apply attempt per queued envelope and stops at the
	/// first failure, leaving the rest queued. Reports the hole below the queue
	/// head if it stalled on one.
	pub async fn drain(&mut self) -> Result<DrainReport, Error> {
		self.refresh().await?;
		if self.state.is_halted() {
			return Ok(DrainReport::default());
		}

		let queued = self.pending.list(self.store.conn()).await?;
		let mut applied = 0;

		for entry in queued {
			let expected = self.state.expected_sequence();
			let sequence = entry.envelope.sequence;

			if sequence < expected {
				self.pending.remove(self.store.conn(), sequence).await?;
				continue;
			}
			if sequence > expected {
				break;
			}

			let (disposition, _) = self
				.admit(&entry.envelope, GapHandling::Suppress, true)
				.await?;

			match disposition {
				Disposition::Applied { .. } => applied += 1,
				Disposition::Duplicate => {
					// Its content is already applied at another sequence
					warn!(
						jar_id = %self.jar_id,
						sequence,
						content_id = %entry.envelope.content_id,
						"Dropping queued envelope replaying applied content"
					);
					self.pending.remove(self.store.conn(), sequence).await?;
				}
				_ => break,
			}
		}

		let gap = self.next_gap().await?;
		if let Some(gap) = gap {
			debug!(jar_id = %self.jar_id, %gap, applied, "Drain stalled on a gap");
		} else {
			trace!(jar_id = %self.jar_id, applied, "Drain finished");
		}

		Ok(DrainReport { applied, gap })
	}

	/// Hole between the next expected sequence and the lowest queued envelope.
	pub async fn next_gap(&mut self) -> Result<Option<SequenceRange>, Error> {
		self.refresh().await?;
		if self.state.is_halted() {
			return Ok(None);
		}

		Ok(self
			.pending
			.head(self.store.conn())
			.await?
			.and_then(|head| SequenceRange::missing_before(self.state.expected_sequence(), head)))
	}

	/// Feeds a backfill response back in, ascending and without gap detection,
	/// then drains whatever became contiguous.
	#[instrument(skip_all, fields(jar_id = %self.jar_id, returned = envelopes.len()), err)]
	pub async fn ingest_backfill(&mut self, envelopes: Vec<Envelope>) -> Result<BackfillIngest, Error> {
		let mut applied = 0;

		for envelope in order_for_delivery(envelopes) {
			let outcome = self.process(&envelope, GapHandling::Suppress).await?;
			if let Disposition::Applied { drained } = outcome.disposition {
				applied += 1 + drained;
			}

			if self.state.is_halted() {
				break;
			}
		}

		let drained = self.drain().await?;

		Ok(BackfillIngest {
			applied: applied + drained.applied,
			gap: drained.gap,
		})
	}

	/// Lifts a halt. Returns whether the jar was halted.
	///
	/// Whatever caused the halt is still recorded: a conflicting envelope
	/// delivered again halts the jar again.
	pub async fn resume(&mut self) -> Result<bool, Error> {
		self.refresh().await?;
		if !self.state.is_halted() {
			return Ok(false);
		}

		self.sequence.resume(self.store.conn()).await?;
		info!(
			jar_id = %self.jar_id,
			reason = self.state.halt_reason().unwrap_or_default(),
			"Resuming halted jar"
		);
		self.state.resume();
		self.verified.clear();

		Ok(true)
	}

	/// Destroys every queued envelope of the jar. Returns how many were dropped.
	pub async fn reset_pending(&mut self) -> Result<u64, Error> {
		let cleared = self.pending.clear(self.store.conn()).await?;
		self.verified.clear();

		info!(jar_id = %self.jar_id, cleared, "Cleared pending queue");

		Ok(cleared)
	}

	async fn admit(
		&mut self,
		envelope: &Envelope,
		handling: GapHandling,
		from_queue: bool,
	) -> Result<(Disposition, Option<SequenceRange>), Error> {
		if envelope.jar_id != self.jar_id {
			return Err(Error::JarMismatch {
				expected: self.jar_id,
				found: envelope.jar_id,
			});
		}

		self.refresh().await?;
		let conn = self.store.conn();

		if self.ledger.contains(conn, &envelope.content_id).await? {
			trace!("Already applied, discarding");
			self.metrics.record_duplicate();
			return Ok((Disposition::Duplicate, None));
		}

		if self.state.is_halted() {
			warn!(
				reason = self.state.halt_reason().unwrap_or_default(),
				"Jar is halted, discarding envelope"
			);
			self.metrics.record_halted_discard();
			return Ok((Disposition::Halted, None));
		}

		if let Some(recorded) = self
			.ledger
			.recorded_content_id(conn, envelope.sequence)
			.await?
		{
			return Err(self.corruption(envelope, recorded).await);
		}

		let expected = self.state.expected_sequence();

		if envelope.sequence > expected {
			let (reason, gap) = match handling {
				GapHandling::Detect => (
					QueueReason::FutureSequence,
					SequenceRange::missing_before(expected, envelope.sequence),
				),
				GapHandling::Suppress => (QueueReason::BackfillOutOfOrder, None),
			};

			let disposition = self.enqueue(envelope, reason).await?;
			let gap = match disposition {
				Disposition::Rejected(_) => None,
				_ => gap,
			};

			return Ok((disposition, gap));
		}

		if envelope.sequence < expected {
			trace!(expected, "Below the expected sequence, discarding");
			self.metrics.record_superseded();
			return Ok((Disposition::Superseded, None));
		}

		Ok((self.apply(envelope, from_queue).await?, None))
	}

	async fn enqueue(&mut self, envelope: &Envelope, reason: QueueReason) -> Result<Disposition, Error> {
		if let Err(e) = self.verify(envelope) {
			warn!(error = %e, "Envelope failed verification, not queueing it");
			self.metrics.record_verification_failure();
			return Ok(Disposition::Rejected(e));
		}

		let conn = self.store.conn();

		if self.pending.len(conn).await? >= self.max_pending
			&& self
				.pending
				.content_id_at(conn, envelope.sequence)
				.await?
				.is_none()
		{
			warn!(
				max_pending = self.max_pending,
				"Pending queue full, dropping envelope until it is delivered again"
			);
			self.metrics.record_queue_full();
			return Ok(Disposition::QueueFull);
		}

		match self.pending.enqueue(conn, envelope, reason).await? {
			EnqueueOutcome::Queued => {
				debug!(%reason, "Queued envelope ahead of the expected sequence");
				self.metrics.record_queued();
				Ok(Disposition::Queued)
			}
			EnqueueOutcome::AlreadyQueued => {
				trace!("Already queued");
				self.metrics.record_duplicate();
				Ok(Disposition::Duplicate)
			}
			EnqueueOutcome::Conflict { queued_content_id } => {
				warn!(
					queued_content_id = %queued_content_id,
					"Another envelope is already queued for this sequence, keeping the first"
				);
				self.metrics.record_queue_conflict();
				Ok(Disposition::QueueConflict { queued_content_id })
			}
		}
	}

	async fn apply(&mut self, envelope: &Envelope, from_queue: bool) -> Result<Disposition, Error> {
		if let Err(e) = self.verify(envelope) {
			self.metrics.record_verification_failure();

			if from_queue && e.is_integrity_failure() {
				let reason = format!("queued envelope failed re-verification: {e}");
				self.halt(reason).await?;
				return Err(Error::ReverificationConflict {
					jar_id: self.jar_id,
					sequence: envelope.sequence,
					source: e,
				});
			}

			warn!(error = %e, from_queue, "Envelope failed verification, not applying it");
			return Ok(Disposition::Rejected(e));
		}

		let txn = self.store.begin().await?;
		let step = match self.write_apply(&txn, envelope).await {
			Ok(ApplyStep::Written) => {
				txn.commit().await?;
				ApplyStep::Written
			}
			Ok(step) => {
				txn.rollback().await?;
				step
			}
			Err(e) => {
				if let Err(rollback) = txn.rollback().await {
					warn!(error = %rollback, "Failed to roll back apply transaction");
				}
				if matches!(e, Error::StaleSequenceState { .. }) {
					// Someone else moved the jar, pick up where it is now
					self.state = self.sequence.load_or_init(self.store.conn()).await?;
				}
				return Err(e);
			}
		};

		match step {
			ApplyStep::Written => {
				self.state.advance_to(envelope.sequence);
				self.verified.remove(&envelope.digest());
				self.metrics.record_applied(from_queue);
				debug!(from_queue, "Applied envelope");

				Ok(Disposition::Applied { drained: 0 })
			}
			ApplyStep::Failed(e) => {
				self.metrics.record_apply_failure();

				if e.is_fatal() {
					self.halt(format!("fatal apply failure at sequence {}: {e}", envelope.sequence))
						.await?;
				} else {
					warn!(error = %e, "Apply failed, sequence stays expected");
				}

				Ok(Disposition::ApplyFailed(e))
			}
			ApplyStep::SequenceTaken(recorded) => Err(self.corruption(envelope, recorded).await),
			ApplyStep::ContentTaken(sequence) => {
				warn!(applied_at = sequence, "Content already applied at another sequence");
				self.metrics.record_duplicate();
				Ok(Disposition::Duplicate)
			}
		}
	}

	/// Adopts the persisted sequence state if another instance moved it.
	async fn refresh(&mut self) -> Result<(), Error> {
		let Some(stored) = self.sequence.load(self.store.conn()).await? else {
			return Ok(());
		};

		if stored != self.state {
			debug!(
				jar_id = %self.jar_id,
				from = self.state.last_applied_sequence(),
				to = stored.last_applied_sequence(),
				halted = stored.is_halted(),
				"Sequence state changed under this reconciler, reloading"
			);
			self.state = stored;
		}

		Ok(())
	}

	/// Every write of an apply, all through `txn`.
	async fn write_apply(
		&self,
		txn: &DatabaseTransaction,
		envelope: &Envelope,
	) -> Result<ApplyStep, Error> {
		if let Err(e) = self.applier.apply(txn, envelope).await {
			return Ok(ApplyStep::Failed(e));
		}

		match self
			.ledger
			.record(txn, envelope.sequence, &envelope.content_id)
			.await?
		{
			RecordOutcome::Inserted => {}
			RecordOutcome::SequenceTaken { recorded } => return Ok(ApplyStep::SequenceTaken(recorded)),
			RecordOutcome::ContentTaken { sequence } => return Ok(ApplyStep::ContentTaken(sequence)),
		}

		self.sequence
			.advance(txn, self.state.last_applied_sequence(), envelope.sequence)
			.await?;
		self.pending.remove(txn, envelope.sequence).await?;

		Ok(ApplyStep::Written)
	}

	fn verify(&mut self, envelope: &Envelope) -> Result<(), VerificationError> {
		let digest = envelope.digest();
		if self.verified.contains(&digest) {
			return Ok(());
		}

		self.verifier.verify(envelope)?;
		self.verified.insert(digest);

		Ok(())
	}

	/// Halts the jar on a sequence claimed by two contents and builds the error
	/// to surface. A failure to persist the halt wins over the corruption.
	async fn corruption(&mut self, envelope: &Envelope, recorded: String) -> Error {
		if let Err(e) = self.halt(SEQUENCE_CONTENT_MISMATCH.to_string()).await {
			return e;
		}

		Error::CorruptionDetected {
			jar_id: self.jar_id,
			sequence: envelope.sequence,
			recorded,
			received: envelope.content_id.clone(),
		}
	}

	async fn halt(&mut self, reason: String) -> Result<(), Error> {
		error!(jar_id = %self.jar_id, %reason, "Halting jar");

		self.sequence.halt(self.store.conn(), &reason).await?;
		self.state.halt(reason);
		self.metrics.record_halt();

		Ok(())
	}
}
