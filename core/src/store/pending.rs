use chrono::{DateTime, Utc};
use jar_sync::{Envelope, JarId, QueueReason, QueuedEnvelope};
use sea_orm::{ConnectionTrait, QueryResult};

use super::statement;
use crate::{
	error::{sequence_from_db, sequence_to_db},
	Error,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
	Queued,
	/// The same envelope is already waiting
	AlreadyQueued,
	/// Another content ID is already waiting for this sequence, it was kept
	Conflict { queued_content_id: String },
}

/// Verified envelopes of one jar waiting for their predecessors.
///
/// Keyed by `(jar, sequence)`, so the queue holds at most one envelope per
/// sequence and reads back already sorted.
#[derive(Debug, Clone)]
pub struct PendingQueue {
	jar_id: JarId,
}

impl PendingQueue {
	pub const fn new(jar_id: JarId) -> Self {
		Self { jar_id }
	}

	pub(crate) async fn init_table<C: ConnectionTrait>(conn: &C) -> Result<(), Error> {
		conn.execute(statement(
			r"
			CREATE TABLE IF NOT EXISTS pending_envelopes (
				jar_id TEXT NOT NULL,
				sequence INTEGER NOT NULL,
				content_id TEXT NOT NULL,
				sender_id TEXT NOT NULL,
				parent_content_id TEXT,
				payload BLOB NOT NULL,
				signature BLOB NOT NULL,
				reason TEXT NOT NULL,
				queued_at TEXT NOT NULL,
				PRIMARY KEY (jar_id, sequence)
			)
			",
			vec![],
		))
		.await?;

		Ok(())
	}

	pub(crate) async fn enqueue<C: ConnectionTrait>(
		&self,
		conn: &C,
		envelope: &Envelope,
		reason: QueueReason,
	) -> Result<EnqueueOutcome, Error> {
		let result = conn
			.execute(statement(
				r"
				INSERT INTO pending_envelopes
				(jar_id, sequence, content_id, sender_id, parent_content_id, payload, signature, reason, queued_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
				ON CONFLICT (jar_id, sequence) DO NOTHING
				",
				vec![
					self.jar_id.to_string().into(),
					sequence_to_db(envelope.sequence)?.into(),
					envelope.content_id.clone().into(),
					envelope.sender_id.clone().into(),
					envelope.parent_content_id.clone().into(),
					envelope.payload.clone().into(),
					envelope.signature.clone().into(),
					reason.as_str().into(),
					Utc::now().to_rfc3339().into(),
				],
			))
			.await?;

		if result.rows_affected() == 1 {
			return Ok(EnqueueOutcome::Queued);
		}

		match self.content_id_at(conn, envelope.sequence).await? {
			Some(queued) if queued == envelope.content_id => Ok(EnqueueOutcome::AlreadyQueued),
			Some(queued_content_id) => Ok(EnqueueOutcome::Conflict { queued_content_id }),
			None => Err(Error::StaleSequenceState {
				jar_id: self.jar_id,
				expected: envelope.sequence,
			}),
		}
	}

	pub async fn content_id_at<C: ConnectionTrait>(
		&self,
		conn: &C,
		sequence: u64,
	) -> Result<Option<String>, Error> {
		conn.query_one(statement(
			r"
			SELECT content_id FROM pending_envelopes
			WHERE jar_id = ? AND sequence = ?
			",
			vec![self.jar_id.to_string().into(), sequence_to_db(sequence)?.into()],
		))
		.await?
		.map(|row| row.try_get::<String>("", "content_id"))
		.transpose()
		.map_err(Into::into)
	}

	/// Every queued envelope, ascending by sequence.
	pub async fn list<C: ConnectionTrait>(&self, conn: &C) -> Result<Vec<QueuedEnvelope>, Error> {
		conn.query_all(statement(
			r"
			SELECT sequence, content_id, sender_id, parent_content_id, payload, signature, reason, queued_at
			FROM pending_envelopes
			WHERE jar_id = ?
			ORDER BY sequence ASC
			",
			vec![self.jar_id.to_string().into()],
		))
		.await?
		.into_iter()
		.map(|row| self.queued_from_row(&row))
		.collect()
	}

	/// Lowest queued sequence.
	pub async fn head<C: ConnectionTrait>(&self, conn: &C) -> Result<Option<u64>, Error> {
		let Some(row) = conn
			.query_one(statement(
				r"
				SELECT MIN(sequence) AS head FROM pending_envelopes
				WHERE jar_id = ?
				",
				vec![self.jar_id.to_string().into()],
			))
			.await?
		else {
			return Ok(None);
		};

		row.try_get::<Option<i64>>("", "head")?
			.map(sequence_from_db)
			.transpose()
	}

	pub async fn len<C: ConnectionTrait>(&self, conn: &C) -> Result<usize, Error> {
		let Some(row) = conn
			.query_one(statement(
				"SELECT COUNT(*) AS total FROM pending_envelopes WHERE jar_id = ?",
				vec![self.jar_id.to_string().into()],
			))
			.await?
		else {
			return Ok(0);
		};

		Ok(usize::try_from(row.try_get::<i64>("", "total")?).unwrap_or(usize::MAX))
	}

	pub(crate) async fn remove<C: ConnectionTrait>(&self, conn: &C, sequence: u64) -> Result<bool, Error> {
		let result = conn
			.execute(statement(
				"DELETE FROM pending_envelopes WHERE jar_id = ? AND sequence = ?",
				vec![self.jar_id.to_string().into(), sequence_to_db(sequence)?.into()],
			))
			.await?;

		Ok(result.rows_affected() > 0)
	}

	/// Drops everything at or below `last_applied`, which can only be stale.
	pub(crate) async fn prune_through<C: ConnectionTrait>(
		&self,
		conn: &C,
		last_applied: u64,
	) -> Result<u64, Error> {
		let result = conn
			.execute(statement(
				"DELETE FROM pending_envelopes WHERE jar_id = ? AND sequence <= ?",
				vec![
					self.jar_id.to_string().into(),
					sequence_to_db(last_applied)?.into(),
				],
			))
			.await?;

		Ok(result.rows_affected())
	}

	pub(crate) async fn clear<C: ConnectionTrait>(&self, conn: &C) -> Result<u64, Error> {
		let result = conn
			.execute(statement(
				"DELETE FROM pending_envelopes WHERE jar_id = ?",
				vec![self.jar_id.to_string().into()],
			))
			.await?;

		Ok(result.rows_affected())
	}

	fn queued_from_row(&self, row: &QueryResult) -> Result<QueuedEnvelope, Error> {
		let reason = row.try_get::<String>("", "reason")?;
		let queued_at = row.try_get::<String>("", "queued_at")?;

		Ok(QueuedEnvelope {
			envelope: Envelope {
				jar_id: self.jar_id,
				sequence: sequence_from_db(row.try_get::<i64>("", "sequence")?)?,
				content_id: row.try_get("", "content_id")?,
				payload: row.try_get("", "payload")?,
				signature: row.try_get("", "signature")?,
				sender_id: row.try_get("", "sender_id")?,
				parent_content_id: row.try_get("", "parent_content_id")?,
			},
			reason: QueueReason::parse(&reason).ok_or(Error::UnknownQueueReason(reason))?,
			queued_at: DateTime::parse_from_rfc3339(&queued_at)?.with_timezone(&Utc),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SyncStore;

	fn envelope(jar_id: JarId, sequence: u64, content_id: &str) -> Envelope {
		Envelope {
			jar_id,
			sequence,
			content_id: content_id.to_string(),
			payload: vec![1, 2, 3],
			signature: vec![9; 64],
			sender_id: "did:buds:alice".to_string(),
			parent_content_id: Some("cid-parent".to_string()),
		}
	}

	#[tokio::test]
	async fn keeps_the_first_envelope_per_sequence() -> Result<(), Error> {
		let store = SyncStore::in_memory().await?;
		let jar_id = JarId::new_v4();
		let queue = PendingQueue::new(jar_id);
		let conn = store.conn();

		let first = envelope(jar_id, 4, "cid-4");
		assert_eq!(
			queue.enqueue(conn, &first, QueueReason::FutureSequence).await?,
			EnqueueOutcome::Queued
		);
		assert_eq!(
			queue.enqueue(conn, &first, QueueReason::FutureSequence).await?,
			EnqueueOutcome::AlreadyQueued
		);
		assert_eq!(
			queue
				.enqueue(conn, &envelope(jar_id, 4, "cid-other"), QueueReason::BackfillOutOfOrder)
				.await?,
			EnqueueOutcome::Conflict {
				queued_content_id: "cid-4".to_string()
			}
		);

		let queued = queue.list(conn).await?;
		assert_eq!(queued.len(), 1);
		assert_eq!(queued[0].envelope, first);
		assert_eq!(queued[0].reason, QueueReason::FutureSequence);

		Ok(())
	}

	#[tokio::test]
	async fn reads_back_sorted_with_head_and_prunes() -> Result<(), Error> {
		let store = SyncStore::in_memory().await?;
		let jar_id = JarId::new_v4();
		let queue = PendingQueue::new(jar_id);
		let conn = store.conn();

		assert_eq!(queue.head(conn).await?, None);

		for sequence in [9, 3, 6] {
			queue
				.enqueue(conn, &envelope(jar_id, sequence, &format!("cid-{sequence}")), QueueReason::FutureSequence)
				.await?;
		}

		let sequences = queue
			.list(conn)
			.await?
			.into_iter()
			.map(|queued| queued.envelope.sequence)
			.collect::<Vec<_>>();
		assert_eq!(sequences, vec![3, 6, 9]);
		assert_eq!(queue.head(conn).await?, Some(3));
		assert_eq!(queue.len(conn).await?, 3);

		assert_eq!(queue.prune_through(conn, 6).await?, 2);
		assert_eq!(queue.head(conn).await?, Some(9));

		assert!(queue.remove(conn, 9).await?);
		assert!(!queue.remove(conn, 9).await?);
		assert_eq!(queue.len(conn).await?, 0);

		Ok(())
	}
}
