//! Projection that records applies in the database it is handed

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Mutex,
	},
};

use async_trait::async_trait;
use jar_core::{
	jar_sync::{Envelope, JarId},
	ApplyError, Applier, SyncStore,
};
use sea_orm::{ConnectionTrait, DatabaseTransaction, DbBackend, Statement};

/// Writes one `applied_receipts` row per apply, inside the apply transaction.
///
/// Rows only exist for committed applies, so reading them back gives exactly
/// the side effects a projection would have kept.
pub struct RecordingApplier {
	calls: AtomicU64,
	failures: Mutex<HashMap<u64, ApplyError>>,
	/// Failures returned after the projection row was already written
	late_failures: Mutex<HashMap<u64, ApplyError>>,
}

impl RecordingApplier {
	pub async fn install(store: &SyncStore) -> Self {
		store
			.conn()
			.execute(Statement::from_string(
				DbBackend::Sqlite,
				r"
				CREATE TABLE IF NOT EXISTS applied_receipts (
					id INTEGER PRIMARY KEY AUTOINCREMENT,
					jar_id TEXT NOT NULL,
					sequence INTEGER NOT NULL,
					content_id TEXT NOT NULL
				)
				",
			))
			.await
			.unwrap();

		Self {
			calls: AtomicU64::new(0),
			failures: Mutex::new(HashMap::new()),
			late_failures: Mutex::new(HashMap::new()),
		}
	}

	/// Fails the next apply of `sequence` with `error`.
	pub fn fail_next(&self, sequence: u64, error: ApplyError) {
		self.failures.lock().unwrap().insert(sequence, error);
	}

	/// Writes the projection row for the next apply of `sequence`, then fails
	/// it with `error`.
	pub fn fail_next_after_write(&self, sequence: u64, error: ApplyError) {
		self.late_failures.lock().unwrap().insert(sequence, error);
	}

	/// Apply attempts, failed ones included.
	pub fn calls(&self) -> u64 {
		self.calls.load(Ordering::SeqCst)
	}

	/// Committed applies of `jar_id`, in the order they happened.
	pub async fn applied(&self, store: &SyncStore, jar_id: JarId) -> Vec<u64> {
		store
			.conn()
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"SELECT sequence FROM applied_receipts WHERE jar_id = ? ORDER BY id ASC",
				vec![jar_id.to_string().into()],
			))
			.await
			.unwrap()
			.into_iter()
			.map(|row| row.try_get::<i64>("", "sequence").unwrap() as u64)
			.collect()
	}
}

#[async_trait]
impl Applier for RecordingApplier {
	async fn apply(&self, txn: &DatabaseTransaction, envelope: &Envelope) -> Result<(), ApplyError> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		let scripted = self.failures.lock().unwrap().remove(&envelope.sequence);
		if let Some(error) = scripted {
			return Err(error);
		}

		txn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT INTO applied_receipts (jar_id, sequence, content_id) VALUES (?, ?, ?)",
			vec![
				envelope.jar_id.to_string().into(),
				(envelope.sequence as i64).into(),
				envelope.content_id.clone().into(),
			],
		))
		.await
		.map_err(|e| ApplyError::transient(e.to_string()))?;

		let late = self.late_failures.lock().unwrap().remove(&envelope.sequence);
		match late {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}
}
