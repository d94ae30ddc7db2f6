use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a jar, the replicated log shared by a set of members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JarId(Uuid);

impl JarId {
	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}

	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl From<Uuid> for JarId {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl fmt::Display for JarId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// A relay-sequenced receipt as delivered to a member.
///
/// Envelopes are immutable once received; the reconciler only ever moves them
/// between the wire, the pending queue and the apply step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	pub jar_id: JarId,
	pub sequence: u64,
	pub content_id: String,
	pub payload: Vec<u8>,
	pub signature: Vec<u8>,
	pub sender_id: String,
	pub parent_content_id: Option<String>,
}

impl Envelope {
	/// Digest over every field of the envelope.
	///
	/// Two envelopes share a digest only if they are byte-for-byte the same
	/// delivery, which makes it a safe key for caching verification results.
	pub fn digest(&self) -> [u8; 32] {
		let mut hasher = blake3::Hasher::new();

		hasher.update(self.jar_id.as_uuid().as_bytes());
		hasher.update(&self.sequence.to_le_bytes());
		let fields: [&[u8]; 4] = [
			self.content_id.as_bytes(),
			&self.payload,
			&self.signature,
			self.sender_id.as_bytes(),
		];
		for field in fields {
			hasher.update(&(field.len() as u64).to_le_bytes());
			hasher.update(field);
		}
		match &self.parent_content_id {
			Some(parent) => {
				hasher.update(&[1]);
				hasher.update(parent.as_bytes());
			}
			None => {
				hasher.update(&[0]);
			}
		}

		*hasher.finalize().as_bytes()
	}
}

/// Sorts envelopes ascending by sequence and drops exact re-deliveries.
///
/// Only envelopes repeating both the sequence number and the content ID are
/// dropped. Envelopes claiming the same sequence with different content are
/// kept in arrival order so the reconciler can detect the conflict.
pub fn order_for_delivery(envelopes: impl IntoIterator<Item = Envelope>) -> Vec<Envelope> {
	let mut envelopes = envelopes.into_iter().collect::<Vec<_>>();

	// Stable sort, arrival order survives among equal sequences
	envelopes.sort_by_key(|envelope| envelope.sequence);

	let mut ordered: Vec<Envelope> = Vec::with_capacity(envelopes.len());
	for envelope in envelopes {
		let seen = ordered
			.iter()
			.rev()
			.take_while(|kept| kept.sequence == envelope.sequence)
			.any(|kept| kept.content_id == envelope.content_id);

		if !seen {
			ordered.push(envelope);
		}
	}

	ordered
}

/// Why an envelope was parked in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueReason {
	/// Delivered ahead of the next expected sequence
	FutureSequence,
	/// Returned by a backfill ahead of the next expected sequence
	BackfillOutOfOrder,
}

impl QueueReason {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::FutureSequence => "future_sequence",
			Self::BackfillOutOfOrder => "backfill_out_of_order",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"future_sequence" => Some(Self::FutureSequence),
			"backfill_out_of_order" => Some(Self::BackfillOutOfOrder),
			_ => None,
		}
	}
}

impl fmt::Display for QueueReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A verified envelope waiting for the sequences below it to be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
	pub envelope: Envelope,
	pub reason: QueueReason,
	pub queued_at: DateTime<Utc>,
}

/// Permanent record that a sequence number of a jar was applied with a given content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedRecord {
	pub jar_id: JarId,
	pub sequence: u64,
	pub content_id: String,
}
