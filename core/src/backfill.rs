//! Recovery of missing sequence ranges from the relay

use std::{
	collections::{BTreeSet, HashMap},
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use jar_sync::{Envelope, JarId, Relay, SequenceRange};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::{metrics::SyncMetrics, Error, Reconciler};

/// A reconciler behind the lock that serializes everything done to its jar.
pub type JarHandle = Arc<tokio::sync::Mutex<Reconciler>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
	/// Requests sent to the relay
	pub requests: u32,
	/// Envelopes applied, queued ones drained along the way included
	pub applied: u64,
	/// What is still missing when the backfill stopped
	pub outstanding: Option<SequenceRange>,
	/// Stopped because an overlapping request was already in flight
	pub skipped: bool,
}

/// Fetches missing ranges and feeds them back to the jar's reconciler.
///
/// At most one request per overlapping range of a jar is in flight. The jar
/// lock is only taken to ingest a response, never across a network call, so
/// deliveries keep flowing while a request is pending.
pub struct BackfillCoordinator {
	relay: Arc<dyn Relay>,
	in_flight: Mutex<HashMap<JarId, Vec<SequenceRange>>>,
	request_timeout: Duration,
	metrics: Arc<SyncMetrics>,
}

/// Releases an in-flight range when dropped, whichever way the request ended.
struct InFlightClaim<'a> {
	in_flight: &'a Mutex<HashMap<JarId, Vec<SequenceRange>>>,
	jar_id: JarId,
	range: SequenceRange,
}

impl Drop for InFlightClaim<'_> {
	fn drop(&mut self) {
		let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

		if let Some(ranges) = in_flight.get_mut(&self.jar_id) {
			if let Some(position) = ranges.iter().position(|range| *range == self.range) {
				ranges.swap_remove(position);
			}
			if ranges.is_empty() {
				in_flight.remove(&self.jar_id);
			}
		}
	}
}

impl BackfillCoordinator {
	pub fn new(relay: Arc<dyn Relay>, request_timeout: Duration, metrics: Arc<SyncMetrics>) -> Self {
		Self {
			relay,
			in_flight: Mutex::new(HashMap::new()),
			request_timeout,
			metrics,
		}
	}

	/// Ranges of `jar_id` currently requested from the relay.
	pub fn in_flight(&self, jar_id: JarId) -> Vec<SequenceRange> {
		self.in_flight
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&jar_id)
			.cloned()
			.unwrap_or_default()
	}

	/// Requests `range` and ingests whatever comes back.
	///
	/// An empty response leaves the range outstanding. A partial one is
	/// ingested, and the hole the drain then stalls on is requested next, for
	/// as long as each round applies something. Any further gap is left to the
	/// caller's next re-check.
	#[instrument(skip_all, fields(%jar_id, %range), err)]
	pub async fn backfill(
		&self,
		jar: &JarHandle,
		jar_id: JarId,
		range: SequenceRange,
	) -> Result<BackfillReport, Error> {
		let mut report = BackfillReport::default();
		let mut next = Some(range);

		while let Some(range) = next.take() {
			let Some(_claim) = self.claim(jar_id, range) else {
				debug!(%range, "Overlapping backfill already in flight, skipping");
				self.metrics.record_backfill_skipped();
				report.skipped = true;
				report.outstanding = Some(range);
				break;
			};

			report.requests += 1;
			let envelopes = self.fetch(jar_id, range).await?;

			if envelopes.is_empty() {
				info!(%range, "Relay returned nothing, range stays outstanding");
				report.outstanding = Some(range);
				break;
			}

			let ingest = jar.lock().await.ingest_backfill(envelopes).await?;
			report.applied += ingest.applied;
			report.outstanding = ingest.gap;

			if ingest.applied > 0 {
				next = ingest.gap;
			} else if let Some(gap) = ingest.gap {
				debug!(%gap, "Backfill applied nothing, leaving the gap for a re-check");
			}
		}

		Ok(report)
	}

	fn claim(&self, jar_id: JarId, range: SequenceRange) -> Option<InFlightClaim<'_>> {
		let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
		let ranges = in_flight.entry(jar_id).or_default();

		if ranges.iter().any(|claimed| claimed.overlaps(&range)) {
			return None;
		}
		ranges.push(range);

		Some(InFlightClaim {
			in_flight: &self.in_flight,
			jar_id,
			range,
		})
	}

	async fn fetch(&self, jar_id: JarId, range: SequenceRange) -> Result<Vec<Envelope>, Error> {
		self.metrics.record_backfill_request();

		let fetched = match timeout(
			self.request_timeout,
			self.relay.fetch_range(jar_id, range.start(), range.end()),
		)
		.await
		{
			Ok(Ok(envelopes)) => envelopes,
			Ok(Err(e)) => {
				self.metrics.record_backfill_failure();
				return Err(e.into());
			}
			Err(_) => {
				warn!(%range, timeout = ?self.request_timeout, "Backfill request timed out, abandoning it");
				self.metrics.record_backfill_failure();
				return Err(Error::BackfillTimeout { jar_id, range });
			}
		};

		let returned = fetched.len();
		let envelopes = fetched
			.into_iter()
			.filter(|envelope| envelope.jar_id == jar_id && range.contains(envelope.sequence))
			.collect::<Vec<_>>();

		if envelopes.len() < returned {
			warn!(
				%range,
				discarded = returned - envelopes.len(),
				"Relay returned envelopes outside the requested range"
			);
		}

		let covered = envelopes
			.iter()
			.map(|envelope| envelope.sequence)
			.collect::<BTreeSet<_>>()
			.len() as u64;
		self.metrics.record_backfill_result(covered, range.len());
		debug!(%range, covered, "Backfill response received");

		Ok(envelopes)
	}
}
