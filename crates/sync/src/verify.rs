use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Envelope;

/// Checks the signature and content hash of an envelope.
///
/// Implementations must be pure: calling `verify` more than once for the same
/// envelope yields the same answer unless the verifier's own inputs (e.g. the
/// sender roster) changed in between.
pub trait Verifier: Send + Sync {
	fn verify(&self, envelope: &Envelope) -> Result<(), VerificationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationErrorKind {
	/// Content ID does not match the payload
	ContentMismatch,
	/// Signature does not verify under the sender's key
	InvalidSignature,
	/// Sender is not a known member of the jar
	UnknownSender,
	/// Signature or content ID could not be decoded
	Malformed,
	/// Sender's key could not be fetched right now
	KeyUnavailable,
	/// Verification material expired and needs refreshing
	Expired,
}

impl VerificationErrorKind {
	/// Whether this kind proves the envelope itself is bad, as opposed to the
	/// verifier being unable to decide at the moment.
	pub const fn is_integrity_failure(&self) -> bool {
		match self {
			Self::ContentMismatch | Self::InvalidSignature | Self::UnknownSender | Self::Malformed => {
				true
			}
			Self::KeyUnavailable | Self::Expired => false,
		}
	}
}

impl fmt::Display for VerificationErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::ContentMismatch => "content mismatch",
			Self::InvalidSignature => "invalid signature",
			Self::UnknownSender => "unknown sender",
			Self::Malformed => "malformed",
			Self::KeyUnavailable => "key unavailable",
			Self::Expired => "expired",
		})
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct VerificationError {
	pub kind: VerificationErrorKind,
	pub message: String,
}

impl VerificationError {
	pub fn new(kind: VerificationErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub const fn is_integrity_failure(&self) -> bool {
		self.kind.is_integrity_failure()
	}
}
