use async_trait::async_trait;

use crate::{Envelope, JarId};

/// Query side of the relay, the authoritative sequencer of a jar.
///
/// The relay is eventually consistent: it may return fewer envelopes than
/// requested, or none at all, for a range it will serve in full later.
#[async_trait]
pub trait Relay: Send + Sync {
	/// Envelopes with sequence numbers in `[from, to]`.
	///
	/// Must never return envelopes outside the range; callers still filter.
	async fn fetch_range(&self, jar_id: JarId, from: u64, to: u64)
		-> Result<Vec<Envelope>, RelayError>;

	/// Up to `limit` envelopes with sequence numbers above `after`.
	async fn fetch_after(
		&self,
		jar_id: JarId,
		after: u64,
		limit: u32,
	) -> Result<Vec<Envelope>, RelayError>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
	#[error("network error: {0}")]
	Network(String),
	#[error("relay unavailable: {0}")]
	Unavailable(String),
	#[error("not authorized to read jar {0}")]
	Unauthorized(JarId),
	#[error("relay protocol error: {0}")]
	Protocol(String),
}
