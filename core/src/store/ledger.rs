use chrono::Utc;
use jar_sync::{JarId, ProcessedRecord};
use sea_orm::ConnectionTrait;

use super::statement;
use crate::{
	error::{sequence_from_db, sequence_to_db},
	Error,
};

/// Result of recording an applied sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
	Inserted,
	/// The sequence already maps to another content ID
	SequenceTaken { recorded: String },
	/// The content ID was already applied at another sequence
	ContentTaken { sequence: u64 },
}

/// Append-only `(jar, sequence) -> content ID` ledger of applied envelopes.
///
/// Backs replay protection (by content ID) and corruption detection (by
/// sequence). Rows are never updated nor deleted.
#[derive(Debug, Clone)]
pub struct ProcessedLedger {
	jar_id: JarId,
}

impl ProcessedLedger {
	pub const fn new(jar_id: JarId) -> Self {
		Self { jar_id }
	}

	pub(crate) async fn init_table<C: ConnectionTrait>(conn: &C) -> Result<(), Error> {
		conn.execute(statement(
			r"
			CREATE TABLE IF NOT EXISTS processed_records (
				jar_id TEXT NOT NULL,
				sequence INTEGER NOT NULL,
				content_id TEXT NOT NULL,
				applied_at TEXT NOT NULL,
				PRIMARY KEY (jar_id, sequence)
			)
			",
			vec![],
		))
		.await?;

		conn.execute(statement(
			r"
			CREATE UNIQUE INDEX IF NOT EXISTS idx_processed_records_content
			ON processed_records(jar_id, content_id)
			",
			vec![],
		))
		.await?;

		Ok(())
	}

	/// Whether this content was already applied to the jar.
	pub async fn contains<C: ConnectionTrait>(&self, conn: &C, content_id: &str) -> Result<bool, Error> {
		Ok(conn
			.query_one(statement(
				r"
				SELECT 1 AS found FROM processed_records
				WHERE jar_id = ? AND content_id = ?
				LIMIT 1
				",
				vec![self.jar_id.to_string().into(), content_id.into()],
			))
			.await?
			.is_some())
	}

	/// Content ID recorded for `sequence`, if that sequence was applied.
	pub async fn recorded_content_id<C: ConnectionTrait>(
		&self,
		conn: &C,
		sequence: u64,
	) -> Result<Option<String>, Error> {
		conn.query_one(statement(
			r"
			SELECT content_id FROM processed_records
			WHERE jar_id = ? AND sequence = ?
			",
			vec![self.jar_id.to_string().into(), sequence_to_db(sequence)?.into()],
		))
		.await?
		.map(|row| row.try_get::<String>("", "content_id"))
		.transpose()
		.map_err(Into::into)
	}

	pub async fn sequence_of<C: ConnectionTrait>(
		&self,
		conn: &C,
		content_id: &str,
	) -> Result<Option<u64>, Error> {
		conn.query_one(statement(
			r"
			SELECT sequence FROM processed_records
			WHERE jar_id = ? AND content_id = ?
			",
			vec![self.jar_id.to_string().into(), content_id.into()],
		))
		.await?
		.map(|row| {
			row.try_get::<i64>("", "sequence")
				.map_err(Error::from)
				.and_then(sequence_from_db)
		})
		.transpose()
	}

	/// Records `sequence -> content_id` if neither side is taken yet.
	///
	/// Never overwrites: a refused insert reports what it collided with.
	pub(crate) async fn record<C: ConnectionTrait>(
		&self,
		conn: &C,
		sequence: u64,
		content_id: &str,
	) -> Result<RecordOutcome, Error> {
		let result = conn
			.execute(statement(
				r"
				INSERT INTO processed_records (jar_id, sequence, content_id, applied_at)
				VALUES (?, ?, ?, ?)
				ON CONFLICT DO NOTHING
				",
				vec![
					self.jar_id.to_string().into(),
					sequence_to_db(sequence)?.into(),
					content_id.into(),
					Utc::now().to_rfc3339().into(),
				],
			))
			.await?;

		if result.rows_affected() == 1 {
			return Ok(RecordOutcome::Inserted);
		}

		if let Some(recorded) = self.recorded_content_id(conn, sequence).await? {
			return Ok(RecordOutcome::SequenceTaken { recorded });
		}

		match self.sequence_of(conn, content_id).await? {
			Some(sequence) => Ok(RecordOutcome::ContentTaken { sequence }),
			// Lost a race against nothing we can see, report it as a stale state
			None => Err(Error::StaleSequenceState {
				jar_id: self.jar_id,
				expected: sequence.saturating_sub(1),
			}),
		}
	}

	/// Highest recorded sequence, 0 for an empty ledger.
	pub async fn highest_sequence<C: ConnectionTrait>(&self, conn: &C) -> Result<u64, Error> {
		let row = conn
			.query_one(statement(
				r"
				SELECT COALESCE(MAX(sequence), 0) AS highest FROM processed_records
				WHERE jar_id = ?
				",
				vec![self.jar_id.to_string().into()],
			))
			.await?;

		match row {
			Some(row) => sequence_from_db(row.try_get::<i64>("", "highest")?),
			None => Ok(0),
		}
	}

	/// Whether the ledger covers exactly `[1, highest]` with no holes.
	pub async fn is_contiguous<C: ConnectionTrait>(&self, conn: &C) -> Result<bool, Error> {
		let Some(row) = conn
			.query_one(statement(
				r"
				SELECT
					COUNT(*) AS total,
					COALESCE(MIN(sequence), 1) AS lowest,
					COALESCE(MAX(sequence), 0) AS highest
				FROM processed_records
				WHERE jar_id = ?
				",
				vec![self.jar_id.to_string().into()],
			))
			.await?
		else {
			return Ok(true);
		};

		let total = row.try_get::<i64>("", "total")?;
		let lowest = row.try_get::<i64>("", "lowest")?;
		let highest = row.try_get::<i64>("", "highest")?;

		Ok(total == highest && lowest == 1)
	}

	/// Every record of the jar, ascending by sequence.
	pub async fn records<C: ConnectionTrait>(&self, conn: &C) -> Result<Vec<ProcessedRecord>, Error> {
		conn.query_all(statement(
			r"
			SELECT sequence, content_id FROM processed_records
			WHERE jar_id = ?
			ORDER BY sequence ASC
			",
			vec![self.jar_id.to_string().into()],
		))
		.await?
		.into_iter()
		.map(|row| -> Result<ProcessedRecord, Error> {
			Ok(ProcessedRecord {
				jar_id: self.jar_id,
				sequence: sequence_from_db(row.try_get::<i64>("", "sequence")?)?,
				content_id: row.try_get::<String>("", "content_id")?,
			})
		})
		.collect()
	}
}
