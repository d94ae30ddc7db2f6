use chrono::Utc;
use jar_sync::JarId;
use sea_orm::{ConnectionTrait, DbErr};
use serde::Serialize;

use super::statement;
use crate::{
	error::{sequence_from_db, sequence_to_db},
	Error,
};

/// Read-only view of how far a jar has been applied.
///
/// Only the reconciler of the jar moves this forward or halts it; everyone
/// else gets copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceState {
	jar_id: JarId,
	last_applied_sequence: u64,
	halted: bool,
	halt_reason: Option<String>,
}

impl SequenceState {
	pub(crate) const fn initial(jar_id: JarId) -> Self {
		Self {
			jar_id,
			last_applied_sequence: 0,
			halted: false,
			halt_reason: None,
		}
	}

	pub const fn jar_id(&self) -> JarId {
		self.jar_id
	}

	/// Highest sequence fully applied, 0 while the jar's root is missing.
	pub const fn last_applied_sequence(&self) -> u64 {
		self.last_applied_sequence
	}

	pub const fn expected_sequence(&self) -> u64 {
		self.last_applied_sequence.saturating_add(1)
	}

	/// Whether the jar's root receipt (sequence 1) has been applied.
	pub const fn is_created(&self) -> bool {
		self.last_applied_sequence > 0
	}

	pub const fn is_halted(&self) -> bool {
		self.halted
	}

	pub fn halt_reason(&self) -> Option<&str> {
		self.halt_reason.as_deref()
	}

	pub(crate) fn advance_to(&mut self, sequence: u64) {
		debug_assert!(sequence > self.last_applied_sequence);
		self.last_applied_sequence = sequence;
	}

	pub(crate) fn halt(&mut self, reason: String) {
		self.halted = true;
		self.halt_reason = Some(reason);
	}

	pub(crate) fn resume(&mut self) {
		self.halted = false;
		self.halt_reason = None;
	}
}

/// Persisted [`SequenceState`] of one jar.
pub(crate) struct SequenceStore {
	jar_id: JarId,
}

impl SequenceStore {
	pub const fn new(jar_id: JarId) -> Self {
		Self { jar_id }
	}

	pub async fn init_table<C: ConnectionTrait>(conn: &C) -> Result<(), Error> {
		conn.execute(statement(
			r"
			CREATE TABLE IF NOT EXISTS jar_sequence_state (
				jar_id TEXT PRIMARY KEY NOT NULL,
				last_applied_sequence INTEGER NOT NULL DEFAULT 0,
				halted INTEGER NOT NULL DEFAULT 0,
				halt_reason TEXT,
				updated_at TEXT NOT NULL
			)
			",
			vec![],
		))
		.await?;

		Ok(())
	}

	pub async fn load_or_init<C: ConnectionTrait>(&self, conn: &C) -> Result<SequenceState, Error> {
		conn.execute(statement(
			r"
			INSERT INTO jar_sequence_state (jar_id, last_applied_sequence, halted, updated_at)
			VALUES (?, 0, 0, ?)
			ON CONFLICT (jar_id) DO NOTHING
			",
			vec![self.jar_id.to_string().into(), Utc::now().to_rfc3339().into()],
		))
		.await?;

		self.load(conn).await?.ok_or_else(|| {
			Error::Database(DbErr::RecordNotFound(format!(
				"sequence state of jar {}",
				self.jar_id
			)))
		})
	}

	/// Current persisted state, `None` before the jar was first loaded.
	pub async fn load<C: ConnectionTrait>(&self, conn: &C) -> Result<Option<SequenceState>, Error> {
		let Some(row) = conn
			.query_one(statement(
				r"
				SELECT last_applied_sequence, halted, halt_reason FROM jar_sequence_state
				WHERE jar_id = ?
				",
				vec![self.jar_id.to_string().into()],
			))
			.await?
		else {
			return Ok(None);
		};

		let mut state = SequenceState::initial(self.jar_id);
		state.last_applied_sequence =
			sequence_from_db(row.try_get::<i64>("", "last_applied_sequence")?)?;
		state.halted = row.try_get::<bool>("", "halted")?;
		state.halt_reason = row.try_get::<Option<String>>("", "halt_reason")?;

		Ok(Some(state))
	}

	/// Moves the jar from `from` to `to`, provided nobody else moved it and it is
	/// not halted.
	pub async fn advance<C: ConnectionTrait>(
		&self,
		conn: &C,
		from: u64,
		to: u64,
	) -> Result<(), Error> {
		let result = conn
			.execute(statement(
				r"
				UPDATE jar_sequence_state
				SET last_applied_sequence = ?, updated_at = ?
				WHERE jar_id = ? AND last_applied_sequence = ? AND halted = 0
				",
				vec![
					sequence_to_db(to)?.into(),
					Utc::now().to_rfc3339().into(),
					self.jar_id.to_string().into(),
					sequence_to_db(from)?.into(),
				],
			))
			.await?;

		if result.rows_affected() == 1 {
			Ok(())
		} else {
			Err(Error::StaleSequenceState {
				jar_id: self.jar_id,
				expected: from,
			})
		}
	}

	pub async fn halt<C: ConnectionTrait>(&self, conn: &C, reason: &str) -> Result<(), Error> {
		conn.execute(statement(
			r"
			UPDATE jar_sequence_state
			SET halted = 1, halt_reason = ?, updated_at = ?
			WHERE jar_id = ?
			",
			vec![
				reason.into(),
				Utc::now().to_rfc3339().into(),
				self.jar_id.to_string().into(),
			],
		))
		.await?;

		Ok(())
	}

	pub async fn resume<C: ConnectionTrait>(&self, conn: &C) -> Result<(), Error> {
		conn.execute(statement(
			r"
			UPDATE jar_sequence_state
			SET halted = 0, halt_reason = NULL, updated_at = ?
			WHERE jar_id = ?
			",
			vec![Utc::now().to_rfc3339().into(), self.jar_id.to_string().into()],
		))
		.await?;

		Ok(())
	}
}
