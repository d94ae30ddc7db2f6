//! Durable state across restarts and reader instances

mod helpers;

use helpers::{test_config, Harness};
use jar_core::{
	jar_sync::{JarId, QueueReason},
	store::PendingQueue,
	Disposition, SyncConfig, SyncStore,
};
use sea_orm::{ConnectionTrait, DbBackend, Statement};

async fn open_store(config: &SyncConfig) -> SyncStore {
	SyncStore::connect(&config.database_url, config.max_connections)
		.await
		.unwrap()
}

fn on_disk_config(dir: &tempfile::TempDir) -> SyncConfig {
	SyncConfig {
		database_url: SyncConfig::default_with_dir(dir.path()).database_url,
		..test_config()
	}
}

#[tokio::test]
async fn restart_resumes_from_the_persisted_state() {
	let dir = tempfile::tempdir().unwrap();
	let config = on_disk_config(&dir);
	let jar_id = JarId::new_v4();

	{
		let harness = Harness::with_store(open_store(&config).await, jar_id, config.clone()).await;
		harness.publish(1..=5);
		harness.relay.withhold([3, 4]);

		harness.deliver(1).await;
		harness.deliver(2).await;
		assert_eq!(harness.deliver(5).await, Disposition::Queued);
		assert_eq!(harness.last_applied().await, 2);
	}

	let harness = Harness::with_store(open_store(&config).await, jar_id, config).await;
	assert_eq!(harness.last_applied().await, 2);
	assert_eq!(harness.applied().await, vec![1, 2]);

	let queued = PendingQueue::new(jar_id)
		.list(harness.store.conn())
		.await
		.unwrap();
	assert_eq!(queued.len(), 1);
	assert_eq!(queued[0].envelope, harness.envelope(5));
	assert_eq!(queued[0].reason, QueueReason::FutureSequence);

	// The restarted relay has everything
	harness.publish(1..=5);
	harness.service.recheck(jar_id).await.unwrap();
	assert_eq!(harness.applied().await, vec![1, 2, 3, 4, 5]);
	assert_eq!(harness.deliver(2).await, Disposition::Duplicate);
}

#[tokio::test]
async fn halt_survives_a_restart() {
	let dir = tempfile::tempdir().unwrap();
	let config = on_disk_config(&dir);
	let jar_id = JarId::new_v4();

	{
		let harness = Harness::with_store(open_store(&config).await, jar_id, config.clone()).await;
		harness.publish(1..=2);
		harness.deliver(1).await;
		assert!(harness.service.deliver(harness.forged(1)).await.is_err());
	}

	let harness = Harness::with_store(open_store(&config).await, jar_id, config).await;
	assert!(harness.service.is_halted(jar_id).await.unwrap());

	harness.publish(1..=2);
	assert_eq!(harness.deliver(2).await, Disposition::Halted);
	assert_eq!(harness.applied().await, vec![1]);
}

#[tokio::test]
async fn ledger_ahead_of_sequence_state_halts_on_load() {
	let dir = tempfile::tempdir().unwrap();
	let config = on_disk_config(&dir);
	let jar_id = JarId::new_v4();

	{
		let harness = Harness::with_store(open_store(&config).await, jar_id, config.clone()).await;
		harness.publish(1..=2);
		harness.deliver(1).await;
		harness.deliver(2).await;

		// Roll the sequence state back behind the ledger
		harness
			.store
			.conn()
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"UPDATE jar_sequence_state SET last_applied_sequence = 1 WHERE jar_id = ?",
				vec![jar_id.to_string().into()],
			))
			.await
			.unwrap();
	}

	let harness = Harness::with_store(open_store(&config).await, jar_id, config).await;
	let state = harness.service.sequence_state(jar_id).await.unwrap();
	assert!(state.is_halted());
	assert_eq!(state.last_applied_sequence(), 1);
}

#[tokio::test]
async fn jars_sharing_a_store_stay_independent() {
	let store = SyncStore::in_memory().await.unwrap();
	let first = Harness::with_store(store.clone(), JarId::new_v4(), test_config()).await;
	let second = Harness::with_store(store, JarId::new_v4(), test_config()).await;
	first.publish(1..=3);
	second.publish(1..=2);

	for sequence in 1..=3 {
		first.deliver(sequence).await;
	}
	second.deliver(1).await;

	assert!(first.service.deliver(first.forged(2)).await.is_err());
	assert!(first.service.is_halted(first.jar_id).await.unwrap());

	assert_eq!(second.deliver(2).await, Disposition::Applied { drained: 0 });
	assert!(!second.service.is_halted(second.jar_id).await.unwrap());
	assert_eq!(second.applied().await, vec![1, 2]);
}

#[tokio::test]
async fn readers_sharing_a_jar_follow_each_other() {
	let store = SyncStore::in_memory().await.unwrap();
	let jar_id = JarId::new_v4();
	let first = Harness::with_store(store.clone(), jar_id, test_config()).await;
	let second = Harness::with_store(store, jar_id, test_config()).await;
	first.publish(1..=4);
	second.publish(1..=4);

	second.service.watch(jar_id).await.unwrap();
	first.deliver(1).await;
	first.deliver(2).await;

	// 3 is next for the jar even though the second reader never applied 1 or 2
	assert_eq!(second.deliver(3).await, Disposition::Applied { drained: 0 });
	assert!(second.relay.range_requests().is_empty());

	assert_eq!(first.deliver(4).await, Disposition::Applied { drained: 0 });
	assert_eq!(first.applied().await, vec![1, 2, 3, 4]);

	assert_eq!(second.service.recheck(jar_id).await.unwrap(), None);
	assert_eq!(second.last_applied().await, 4);
	assert_eq!(second.deliver(2).await, Disposition::Duplicate);
}
