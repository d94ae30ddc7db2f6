//! Test helper modules for integration tests

#![allow(dead_code)]

pub mod applier;
pub mod relay;

pub use applier::*;
pub use relay::*;

use std::{sync::Arc, time::Duration};

use ed25519_dalek::SigningKey;
use jar_core::{
	jar_sync::{content_id_for, Ed25519Verifier, Envelope, EnvelopeSigner, JarId},
	Disposition, JarSyncService, SyncConfig, SyncStore,
};

/// Config with short timeouts and retry delays.
pub fn test_config() -> SyncConfig {
	SyncConfig {
		request_timeout_secs: 2,
		backfill_max_attempts: 3,
		backfill_retry_base_ms: 10,
		poll_interval_secs: 1,
		..SyncConfig::default()
	}
}

pub fn init_test_tracing() {
	use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

	let _ = tracing_subscriber::registry()
		.with(fmt::layer().with_target(true).with_test_writer())
		.with(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("jar_core=debug,jar_sync=debug")),
		)
		.try_init();
}

/// One reader of one jar, wired to a mock relay and a recording projection.
pub struct Harness {
	pub jar_id: JarId,
	pub signer: EnvelopeSigner,
	pub store: SyncStore,
	pub relay: Arc<MockRelay>,
	pub applier: Arc<RecordingApplier>,
	pub service: Arc<JarSyncService>,
}

impl Harness {
	pub async fn new() -> Self {
		Self::with_config(test_config()).await
	}

	pub async fn with_config(config: SyncConfig) -> Self {
		let store = SyncStore::in_memory().await.unwrap();
		Self::with_store(store, JarId::new_v4(), config).await
	}

	/// Builds a reader over an existing store, as a restarted process would.
	pub async fn with_store(store: SyncStore, jar_id: JarId, config: SyncConfig) -> Self {
		init_test_tracing();

		let signer = signer();
		let verifier = Ed25519Verifier::new().with_sender(signer.sender_id(), signer.verifying_key());
		let relay = Arc::new(MockRelay::new());
		let applier = Arc::new(RecordingApplier::install(&store).await);

		let service = Arc::new(JarSyncService::new(
			store.clone(),
			Arc::new(verifier),
			applier.clone(),
			relay.clone(),
			config,
		));

		Self {
			jar_id,
			signer,
			store,
			relay,
			applier,
			service,
		}
	}

	/// The envelope the relay sequenced at `sequence` for this jar.
	pub fn envelope(&self, sequence: u64) -> Envelope {
		envelope_for(&self.signer, self.jar_id, sequence)
	}

	/// An envelope claiming `sequence` with content the relay never sequenced there.
	pub fn forged(&self, sequence: u64) -> Envelope {
		self.signer.seal(
			self.jar_id,
			sequence,
			format!("{}:{sequence}:forged", self.jar_id).into_bytes(),
			None,
		)
	}

	/// Publishes `sequences` on the relay.
	pub fn publish(&self, sequences: impl IntoIterator<Item = u64>) {
		self.relay
			.publish(sequences.into_iter().map(|sequence| self.envelope(sequence)));
	}

	pub async fn deliver(&self, sequence: u64) -> Disposition {
		self.service.deliver(self.envelope(sequence)).await.unwrap()
	}

	pub async fn applied(&self) -> Vec<u64> {
		self.applier.applied(&self.store, self.jar_id).await
	}

	pub async fn last_applied(&self) -> u64 {
		self.service
			.sequence_state(self.jar_id)
			.await
			.unwrap()
			.last_applied_sequence()
	}

	/// Polls `check` until it holds, for at most `within`.
	pub async fn eventually<F, Fut>(&self, within: Duration, check: F) -> bool
	where
		F: Fn() -> Fut,
		Fut: std::future::Future<Output = bool>,
	{
		let deadline = tokio::time::Instant::now() + within;
		while tokio::time::Instant::now() < deadline {
			if check().await {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		check().await
	}
}

pub fn signer() -> EnvelopeSigner {
	EnvelopeSigner::new("did:buds:relay-member", SigningKey::from_bytes(&[42; 32]))
}

/// Payloads chain to their predecessor the way receipts do.
pub fn envelope_for(signer: &EnvelopeSigner, jar_id: JarId, sequence: u64) -> Envelope {
	let payload = |sequence: u64| format!("{jar_id}:{sequence}").into_bytes();
	let parent = (sequence > 1).then(|| content_id_for(&payload(sequence - 1)));

	signer.seal(jar_id, sequence, payload(sequence), parent)
}
