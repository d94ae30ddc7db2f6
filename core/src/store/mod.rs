//! Durable reconciliation state
//!
//! Everything a reader must not lose across restarts lives in SQLite: the
//! sequence state of each jar, the ledger of applied records and the pending
//! queue. Several reconciler instances (or one instance across restarts) only
//! ever meet through these tables.

use sea_orm::{
	ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbBackend, Statement,
	TransactionTrait, Value,
};
use tracing::debug;

use crate::Error;

mod ledger;
mod pending;
mod sequence;

pub use ledger::{ProcessedLedger, RecordOutcome};
pub use pending::{EnqueueOutcome, PendingQueue};
pub use sequence::SequenceState;
pub(crate) use sequence::SequenceStore;

/// Handle to the database backing every jar of this reader.
#[derive(Debug, Clone)]
pub struct SyncStore {
	conn: DatabaseConnection,
}

impl SyncStore {
	/// Connect to `url` and create the reconciliation tables if needed.
	///
	/// SQLite admits a single writer, so callers normally keep
	/// `max_connections` at 1.
	pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
		let mut options = ConnectOptions::new(url.to_owned());
		options
			.max_connections(max_connections.max(1))
			.min_connections(1)
			.sqlx_logging(false);

		let conn = Database::connect(options).await?;
		Self::from_connection(conn).await
	}

	/// Private in-memory database for tests, gone once the store is dropped or
	/// its pooled connection is recycled.
	pub async fn in_memory() -> Result<Self, Error> {
		Self::connect("sqlite::memory:", 1).await
	}

	pub async fn from_connection(conn: DatabaseConnection) -> Result<Self, Error> {
		SequenceStore::init_table(&conn).await?;
		ProcessedLedger::init_table(&conn).await?;
		PendingQueue::init_table(&conn).await?;

		debug!("Reconciliation tables ready");

		Ok(Self { conn })
	}

	pub const fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}

	/// Starts the transaction an apply commits in.
	///
	/// While it is open, every statement of the apply must go through it: with a
	/// single pooled connection a statement on [`Self::conn`] would wait forever.
	pub async fn begin(&self) -> Result<DatabaseTransaction, Error> {
		Ok(self.conn.begin().await?)
	}
}

pub(crate) fn statement(sql: &str, values: Vec<Value>) -> Statement {
	Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
}
