use jar_sync::{JarId, RelayError, SequenceRange, VerificationError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("relay error: {0}")]
	Relay(#[from] RelayError),
	#[error("backfill of {range} for jar {jar_id} timed out")]
	BackfillTimeout { jar_id: JarId, range: SequenceRange },
	#[error("polling the relay for jar {jar_id} timed out")]
	PollTimeout { jar_id: JarId },
	#[error(
		"corruption detected in jar {jar_id} at sequence {sequence}: \
		recorded content <{recorded}>, received <{received}>"
	)]
	CorruptionDetected {
		jar_id: JarId,
		sequence: u64,
		recorded: String,
		received: String,
	},
	#[error("queued envelope at sequence {sequence} of jar {jar_id} failed re-verification: {source}")]
	ReverificationConflict {
		jar_id: JarId,
		sequence: u64,
		#[source]
		source: VerificationError,
	},
	#[error("envelope for jar {found} routed to the reconciler of jar {expected}")]
	JarMismatch { expected: JarId, found: JarId },
	#[error("sequence number {0} does not fit in storage")]
	SequenceOutOfRange(u64),
	#[error("stored sequence number {0} is negative")]
	InvalidStoredSequence(i64),
	#[error("sequence state of jar {jar_id} is no longer at {expected}")]
	StaleSequenceState { jar_id: JarId, expected: u64 },
	#[error("invalid stored timestamp: {0}")]
	InvalidTimestamp(#[from] chrono::ParseError),
	#[error("unknown stored queue reason: {0}")]
	UnknownQueueReason(String),
}

impl Error {
	/// Errors that halted the jar and need operator or policy intervention.
	pub const fn is_corruption(&self) -> bool {
		matches!(
			self,
			Self::CorruptionDetected { .. } | Self::ReverificationConflict { .. }
		)
	}

	/// Errors worth retrying later; nothing was written when they happened.
	pub const fn is_recoverable(&self) -> bool {
		matches!(
			self,
			Self::Relay(_) | Self::BackfillTimeout { .. } | Self::PollTimeout { .. }
		)
	}
}

pub(crate) fn sequence_to_db(sequence: u64) -> Result<i64, Error> {
	i64::try_from(sequence).map_err(|_| Error::SequenceOutOfRange(sequence))
}

pub(crate) fn sequence_from_db(sequence: i64) -> Result<u64, Error> {
	u64::try_from(sequence).map_err(|_| Error::InvalidStoredSequence(sequence))
}
