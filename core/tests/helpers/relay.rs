//! In-memory relay for reconciliation integration tests

use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	sync::{
		atomic::{AtomicBool, AtomicU32, Ordering},
		Mutex,
	},
};

use async_trait::async_trait;
use jar_core::jar_sync::{Envelope, JarId, Relay, RelayError};
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRequest {
	Range { from: u64, to: u64 },
	After { after: u64, limit: u32 },
}

/// Relay holding every published envelope, with knobs to misbehave.
pub struct MockRelay {
	log: Mutex<HashMap<JarId, BTreeMap<u64, Envelope>>>,
	/// Sequences the relay does not serve yet
	withheld: Mutex<BTreeSet<u64>>,
	/// Most envelopes a range response carries
	page_limit: Mutex<Option<usize>>,
	/// Requests still to fail with a network error
	failures: AtomicU32,
	requests: Mutex<Vec<RelayRequest>>,
	held: AtomicBool,
	gate: Semaphore,
	entered: Notify,
}

impl MockRelay {
	pub fn new() -> Self {
		Self {
			log: Mutex::new(HashMap::new()),
			withheld: Mutex::new(BTreeSet::new()),
			page_limit: Mutex::new(None),
			failures: AtomicU32::new(0),
			requests: Mutex::new(Vec::new()),
			held: AtomicBool::new(false),
			gate: Semaphore::new(0),
			entered: Notify::new(),
		}
	}

	pub fn publish(&self, envelopes: impl IntoIterator<Item = Envelope>) {
		let mut log = self.log.lock().unwrap();
		for envelope in envelopes {
			log.entry(envelope.jar_id)
				.or_default()
				.insert(envelope.sequence, envelope);
		}
	}

	pub fn withhold(&self, sequences: impl IntoIterator<Item = u64>) {
		self.withheld.lock().unwrap().extend(sequences);
	}

	pub fn serve_all(&self) {
		self.withheld.lock().unwrap().clear();
	}

	pub fn set_page_limit(&self, limit: Option<usize>) {
		*self.page_limit.lock().unwrap() = limit;
	}

	pub fn fail_next(&self, requests: u32) {
		self.failures.store(requests, Ordering::SeqCst);
	}

	/// Makes range requests wait until [`Self::release`].
	pub fn hold(&self) {
		self.held.store(true, Ordering::SeqCst);
	}

	pub fn release(&self) {
		self.held.store(false, Ordering::SeqCst);
		self.gate.add_permits(1_024);
	}

	/// Resolves once a range request is waiting on [`Self::hold`].
	pub async fn wait_for_held_request(&self) {
		self.entered.notified().await;
	}

	pub fn requests(&self) -> Vec<RelayRequest> {
		self.requests.lock().unwrap().clone()
	}

	pub fn range_requests(&self) -> Vec<(u64, u64)> {
		self.requests()
			.into_iter()
			.filter_map(|request| match request {
				RelayRequest::Range { from, to } => Some((from, to)),
				RelayRequest::After { .. } => None,
			})
			.collect()
	}

	fn fail_if_scripted(&self) -> Result<(), RelayError> {
		let failed = self
			.failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();

		if failed {
			Err(RelayError::Network("connection reset by peer".to_string()))
		} else {
			Ok(())
		}
	}

	fn served(&self, jar_id: JarId, sequences: impl Fn(u64) -> bool) -> Vec<Envelope> {
		let withheld = self.withheld.lock().unwrap();

		self.log
			.lock()
			.unwrap()
			.get(&jar_id)
			.map(|log| {
				log.values()
					.filter(|envelope| sequences(envelope.sequence))
					.filter(|envelope| !withheld.contains(&envelope.sequence))
					.cloned()
					.collect()
			})
			.unwrap_or_default()
	}
}

#[async_trait]
impl Relay for MockRelay {
	async fn fetch_range(
		&self,
		jar_id: JarId,
		from: u64,
		to: u64,
	) -> Result<Vec<Envelope>, RelayError> {
		self.requests
			.lock()
			.unwrap()
			.push(RelayRequest::Range { from, to });

		if self.held.load(Ordering::SeqCst) {
			self.entered.notify_one();
			self.gate
				.acquire()
				.await
				.map_err(|e| RelayError::Unavailable(e.to_string()))?
				.forget();
		}

		self.fail_if_scripted()?;

		let page_limit = *self.page_limit.lock().unwrap();
		let mut envelopes = self.served(jar_id, |sequence| from <= sequence && sequence <= to);
		if let Some(limit) = page_limit {
			envelopes.truncate(limit);
		}

		Ok(envelopes)
	}

	async fn fetch_after(
		&self,
		jar_id: JarId,
		after: u64,
		limit: u32,
	) -> Result<Vec<Envelope>, RelayError> {
		self.requests
			.lock()
			.unwrap()
			.push(RelayRequest::After { after, limit });

		self.fail_if_scripted()?;

		let mut envelopes = self.served(jar_id, |sequence| sequence > after);
		envelopes.truncate(limit as usize);

		Ok(envelopes)
	}
}
