//! Projection of verified envelopes onto domain state

use async_trait::async_trait;
use jar_sync::Envelope;
use sea_orm::DatabaseTransaction;
use serde::{Deserialize, Serialize};

/// Mutates domain state for one verified envelope.
///
/// The transaction is the one the processed record and the sequence advance
/// are written in: whatever the applier writes through it commits together
/// with them or not at all. Writing through any other connection breaks that
/// coupling (and, with a single pooled connection, never completes).
///
/// The reconciler already deduplicates by content ID before calling `apply`.
#[async_trait]
pub trait Applier: Send + Sync {
	async fn apply(&self, txn: &DatabaseTransaction, envelope: &Envelope) -> Result<(), ApplyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplyErrorKind {
	/// Worth retrying on redelivery or backfill, e.g. storage contention
	Transient,
	/// The jar cannot make progress past this envelope, halts it
	Fatal,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?} apply failure: {message}")]
pub struct ApplyError {
	pub kind: ApplyErrorKind,
	pub message: String,
}

impl ApplyError {
	pub fn transient(message: impl Into<String>) -> Self {
		Self {
			kind: ApplyErrorKind::Transient,
			message: message.into(),
		}
	}

	pub fn fatal(message: impl Into<String>) -> Self {
		Self {
			kind: ApplyErrorKind::Fatal,
			message: message.into(),
		}
	}

	pub const fn is_fatal(&self) -> bool {
		matches!(self.kind, ApplyErrorKind::Fatal)
	}
}
