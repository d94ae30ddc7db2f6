//! Reader-side entry point
//!
//! [`JarSyncService`] keeps one reconciler per jar behind its own mutex, routes
//! deliveries to it, polls the relay, and runs backfills with the jar lock
//! released so that a slow relay never stalls delivery to the jar.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use futures::future::join_all;
use jar_sync::{order_for_delivery, Envelope, JarId, Relay, SequenceRange, Verifier};
use serde::Serialize;
use tokio::{
	sync::{Mutex, Notify, RwLock},
	task::JoinHandle,
	time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
	apply::Applier,
	backfill::{BackfillCoordinator, BackfillReport, JarHandle},
	metrics::{SyncMetrics, SyncMetricsSnapshot},
	reconciler::{Disposition, GapHandling, Reconciler},
	store::{SequenceState, SyncStore},
	Error, SyncConfig,
};

/// Summary of one poll of a jar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
	/// Envelopes the relay returned for the jar above the last applied sequence
	pub fetched: usize,
	/// Applies, drained ones included
	pub applied: u64,
	pub queued: u64,
	pub duplicates: u64,
	pub queue_conflicts: u64,
	pub rejected: u64,
	pub apply_failures: u64,
	pub halted: bool,
}

impl PollReport {
	fn record(&mut self, disposition: &Disposition) {
		match disposition {
			Disposition::Applied { drained } => self.applied += 1 + drained,
			Disposition::Queued => self.queued += 1,
			Disposition::Duplicate | Disposition::Superseded => self.duplicates += 1,
			Disposition::QueueConflict { .. } => self.queue_conflicts += 1,
			Disposition::Rejected(_) => self.rejected += 1,
			Disposition::ApplyFailed(_) => self.apply_failures += 1,
			Disposition::Halted => self.halted = true,
			Disposition::QueueFull => {}
		}
	}
}

pub struct JarSyncService {
	store: SyncStore,
	verifier: Arc<dyn Verifier>,
	applier: Arc<dyn Applier>,
	relay: Arc<dyn Relay>,
	coordinator: BackfillCoordinator,
	jars: RwLock<HashMap<JarId, JarHandle>>,
	config: SyncConfig,
	metrics: Arc<SyncMetrics>,
	is_running: AtomicBool,
	shutdown: Notify,
}

impl JarSyncService {
	pub fn new(
		store: SyncStore,
		verifier: Arc<dyn Verifier>,
		applier: Arc<dyn Applier>,
		relay: Arc<dyn Relay>,
		config: SyncConfig,
	) -> Self {
		let metrics = Arc::new(SyncMetrics::new());

		info!(
			max_pending_per_jar = config.max_pending_per_jar,
			poll_interval_secs = config.poll_interval_secs,
			"Creating jar sync service"
		);

		Self {
			store,
			verifier,
			applier,
			coordinator: BackfillCoordinator::new(
				Arc::clone(&relay),
				config.request_timeout(),
				Arc::clone(&metrics),
			),
			relay,
			jars: RwLock::new(HashMap::new()),
			config,
			metrics,
			is_running: AtomicBool::new(false),
			shutdown: Notify::new(),
		}
	}

	/// Validates `config`, connects to its database and builds the service on it.
	pub async fn from_config(
		config: SyncConfig,
		verifier: Arc<dyn Verifier>,
		applier: Arc<dyn Applier>,
		relay: Arc<dyn Relay>,
	) -> Result<Self, Error> {
		config
			.validate()
			.map_err(|e| Error::InvalidConfig(e.to_string()))?;
		let store = SyncStore::connect(&config.database_url, config.max_connections).await?;

		Ok(Self::new(store, verifier, applier, relay, config))
	}

	pub const fn store(&self) -> &SyncStore {
		&self.store
	}

	pub const fn config(&self) -> &SyncConfig {
		&self.config
	}

	pub fn metrics(&self) -> SyncMetricsSnapshot {
		self.metrics.snapshot()
	}

	/// Ranges of the jar currently requested from the relay.
	pub fn backfills_in_flight(&self, jar_id: JarId) -> Vec<SequenceRange> {
		self.coordinator.in_flight(jar_id)
	}

	/// Starts tracking a jar so the background loop polls it.
	pub async fn watch(&self, jar_id: JarId) -> Result<(), Error> {
		self.jar(jar_id).await.map(|_| ())
	}

	/// Jars loaded so far, the ones the background loop polls.
	pub async fn jars(&self) -> Vec<JarId> {
		self.jars.read().await.keys().copied().collect()
	}

	/// Processes one envelope delivered by the relay.
	///
	/// If it exposes a gap, the gap is backfilled before returning, with the jar
	/// unlocked in the meantime. Relay failures during that backfill are retried
	/// and finally logged; they do not fail the delivery.
	pub async fn deliver(&self, envelope: Envelope) -> Result<Disposition, Error> {
		let jar_id = envelope.jar_id;
		let jar = self.jar(jar_id).await?;

		let outcome = jar
			.lock()
			.await
			.process(&envelope, GapHandling::Detect)
			.await?;

		if let Some(gap) = outcome.gap {
			self.backfill_with_retry(&jar, jar_id, gap).await?;
		}

		Ok(outcome.disposition)
	}

	/// Fetches what the relay has after the last applied sequence and delivers it.
	pub async fn poll(&self, jar_id: JarId) -> Result<PollReport, Error> {
		let jar = self.jar(jar_id).await?;
		let after = jar.lock().await.state().last_applied_sequence();

		let fetched = timeout(
			self.config.request_timeout(),
			self.relay.fetch_after(jar_id, after, self.config.poll_limit),
		)
		.await
		.map_err(|_| Error::PollTimeout { jar_id })??;

		let envelopes = order_for_delivery(
			fetched
				.into_iter()
				.filter(|envelope| envelope.jar_id == jar_id && envelope.sequence > after),
		);

		let mut report = PollReport {
			fetched: envelopes.len(),
			..PollReport::default()
		};

		for envelope in envelopes {
			let disposition = self.deliver(envelope).await?;
			report.record(&disposition);

			if report.halted {
				break;
			}
		}

		debug!(%jar_id, after, ?report, "Polled relay");

		Ok(report)
	}

	/// Polls every tracked jar concurrently.
	pub async fn poll_all(&self) -> Vec<(JarId, Result<PollReport, Error>)> {
		let jar_ids = self.jars().await;

		join_all(
			jar_ids
				.into_iter()
				.map(|jar_id| async move { (jar_id, self.poll(jar_id).await) }),
		)
		.await
	}

	/// Drains the jar and backfills whatever gap remains.
	///
	/// Returns the gap still outstanding afterwards.
	pub async fn recheck(&self, jar_id: JarId) -> Result<Option<SequenceRange>, Error> {
		let jar = self.jar(jar_id).await?;

		let gap = jar.lock().await.drain().await?.gap;
		if let Some(gap) = gap {
			self.backfill_with_retry(&jar, jar_id, gap).await?;
		}

		let outstanding = jar.lock().await.next_gap().await?;
		Ok(outstanding)
	}

	/// Read-only copy of the jar's sequence state.
	pub async fn sequence_state(&self, jar_id: JarId) -> Result<SequenceState, Error> {
		let jar = self.jar(jar_id).await?;
		let state = jar.lock().await.state().clone();
		Ok(state)
	}

	pub async fn is_halted(&self, jar_id: JarId) -> Result<bool, Error> {
		let jar = self.jar(jar_id).await?;
		let halted = jar.lock().await.is_halted();
		Ok(halted)
	}

	/// Lifts a halt and re-checks the jar. Returns whether it was halted.
	pub async fn resume(&self, jar_id: JarId) -> Result<bool, Error> {
		let jar = self.jar(jar_id).await?;

		let resumed = jar.lock().await.resume().await?;
		if resumed {
			self.recheck(jar_id).await?;
		}

		Ok(resumed)
	}

	/// Destroys the jar's queued envelopes. Returns how many were dropped.
	pub async fn reset(&self, jar_id: JarId) -> Result<u64, Error> {
		let jar = self.jar(jar_id).await?;
		let cleared = jar.lock().await.reset_pending().await?;
		Ok(cleared)
	}

	/// Spawns the loop polling and re-checking every tracked jar on
	/// `poll_interval_secs`. Returns `None` if it is already running.
	pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
		if self
			.is_running
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			warn!("Jar sync loop already running");
			return None;
		}

		info!("Starting jar sync loop");

		let service = Arc::clone(self);
		Some(tokio::spawn(async move {
			let mut ticker = interval(service.config.poll_interval());
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					() = service.shutdown.notified() => break,
					_ = ticker.tick() => service.tick().await,
				}
			}

			service.is_running.store(false, Ordering::SeqCst);
			info!("Jar sync loop stopped");
		}))
	}

	pub fn stop(&self) {
		if !self.is_running.load(Ordering::SeqCst) {
			return;
		}

		info!("Stopping jar sync loop");
		self.shutdown.notify_one();
	}

	pub fn is_running(&self) -> bool {
		self.is_running.load(Ordering::SeqCst)
	}

	async fn tick(&self) {
		for (jar_id, result) in self.poll_all().await {
			let result = match result {
				Ok(_) => self.recheck(jar_id).await.map(|_| ()),
				Err(e) => Err(e),
			};

			match result {
				Ok(()) => {}
				Err(e) if e.is_corruption() => {
					error!(%jar_id, error = %e, "Jar halted on corruption");
				}
				Err(e) => warn!(%jar_id, error = %e, "Failed to sync jar"),
			}
		}
	}

	/// Backfills `gap`, retrying relay failures with exponential backoff.
	///
	/// The gap is recomputed before each retry since deliveries may have closed
	/// part of it meanwhile. Once attempts run out the gap is left for the next
	/// re-check. Anything but a relay failure propagates.
	async fn backfill_with_retry(
		&self,
		jar: &JarHandle,
		jar_id: JarId,
		gap: SequenceRange,
	) -> Result<Option<BackfillReport>, Error> {
		let mut gap = gap;
		let mut attempt = 1;

		loop {
			match self.coordinator.backfill(jar, jar_id, gap).await {
				Ok(report) => return Ok(Some(report)),
				Err(e) if e.is_recoverable() && attempt < self.config.backfill_max_attempts => {
					let delay = self.config.backfill_retry_delay(attempt);
					warn!(
						%jar_id,
						%gap,
						attempt,
						?delay,
						error = %e,
						"Backfill failed, retrying"
					);
					sleep(delay).await;
					attempt += 1;

					match jar.lock().await.next_gap().await? {
						Some(next) => gap = next,
						None => return Ok(None),
					}
				}
				Err(e) if e.is_recoverable() => {
					warn!(
						%jar_id,
						%gap,
						attempts = attempt,
						error = %e,
						"Backfill failed, leaving the gap for the next re-check"
					);
					return Ok(None);
				}
				Err(e) => return Err(e),
			}
		}
	}

	async fn jar(&self, jar_id: JarId) -> Result<JarHandle, Error> {
		if let Some(jar) = self.jars.read().await.get(&jar_id) {
			return Ok(Arc::clone(jar));
		}

		let mut jars = self.jars.write().await;
		if let Some(jar) = jars.get(&jar_id) {
			return Ok(Arc::clone(jar));
		}

		let reconciler = Reconciler::load(
			jar_id,
			self.store.clone(),
			Arc::clone(&self.verifier),
			Arc::clone(&self.applier),
			&self.config,
			Arc::clone(&self.metrics),
		)
		.await?;

		let jar = Arc::new(Mutex::new(reconciler));
		jars.insert(jar_id, Arc::clone(&jar));

		Ok(jar)
	}
}
