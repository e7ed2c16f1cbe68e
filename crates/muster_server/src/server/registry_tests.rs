#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use muster_domain::{RoomKey, SignalId, UserId};
use muster_queue::{JobQueue, JobType};
use tokio_util::sync::CancellationToken;

use crate::server::registry::{RegistryConfig, RegistryError, RoomRegistry};
use crate::server::store::{MemoryStore, SignalRecord, SignalStatus, Store};
use crate::util::time::unix_ms_now;

fn signal(id: u64, scheduled_at_ms: i64) -> SignalRecord {
	SignalRecord {
		id: SignalId(id),
		title: format!("signal {id}"),
		status: SignalStatus::Full,
		creator_id: UserId(1),
		scheduled_at_ms,
		expires_at_ms: scheduled_at_ms,
		current_participants: 4,
		max_participants: 4,
	}
}

fn registry(store: Arc<MemoryStore>, cfg: RegistryConfig) -> (RoomRegistry, JobQueue, CancellationToken) {
	let queue = JobQueue::new(Arc::new(muster_queue::MemoryStore::new()));
	let cancel = CancellationToken::new();
	let registry = RoomRegistry::new(store as Arc<dyn Store>, queue.clone(), cfg, cancel.clone());
	(registry, queue, cancel)
}

#[tokio::test]
async fn duplicate_create_yields_one_live_room() {
	let store = Arc::new(MemoryStore::new());
	store.insert_signal(signal(1, unix_ms_now() + 60_000));
	let (registry, _queue, _cancel) = registry(store, RegistryConfig::default());

	let key = RoomKey::for_signal(SignalId(1));
	let a = registry.get_or_create(key).await.expect("first create");
	let b = registry.get_or_create(key).await.expect("second lookup");

	assert_eq!(a.key(), b.key());
	assert_eq!(registry.live_rooms().await, 1);
}

#[tokio::test]
async fn unknown_signal_is_rejected() {
	let store = Arc::new(MemoryStore::new());
	let (registry, _queue, _cancel) = registry(store, RegistryConfig::default());

	let err = registry
		.get_or_create(RoomKey::for_signal(SignalId(404)))
		.await
		.expect_err("no backing signal");
	assert!(matches!(err, RegistryError::SignalNotFound(SignalId(404))));
	assert_eq!(registry.live_rooms().await, 0);
}

#[tokio::test]
async fn destroy_is_idempotent() {
	let store = Arc::new(MemoryStore::new());
	store.insert_signal(signal(2, unix_ms_now() + 60_000));
	let (registry, _queue, _cancel) = registry(store, RegistryConfig::default());

	let key = RoomKey::for_signal(SignalId(2));
	registry.get_or_create(key).await.expect("create");

	assert!(registry.destroy(key).await);
	assert!(!registry.destroy(key).await);
	assert_eq!(registry.live_rooms().await, 0);
}

#[tokio::test]
async fn room_with_db_row_gets_a_teardown_job() {
	let store = Arc::new(MemoryStore::new());
	store.insert_signal(signal(3, unix_ms_now() + 60_000));
	store
		.create_chat_room(SignalId(3), "signal 3", unix_ms_now() + 60_000)
		.await
		.expect("room row");
	let (registry, queue, _cancel) = registry(store, RegistryConfig::default());

	registry
		.get_or_create(RoomKey::for_signal(SignalId(3)))
		.await
		.expect("create");

	let stats = queue.stats(JobType::ExpireChatRoom).await.expect("stats");
	assert_eq!(stats.delayed, 1, "registry schedules teardown at room expiry");
}

#[tokio::test]
async fn fallback_timer_destroys_an_overdue_room() {
	let store = Arc::new(MemoryStore::new());
	// Scheduled in the past and no grace: the room is overdue on creation.
	store.insert_signal(signal(4, unix_ms_now() - 1_000));
	let (registry, _queue, _cancel) = registry(
		store,
		RegistryConfig {
			room_grace: Duration::ZERO,
			..RegistryConfig::default()
		},
	);

	registry
		.get_or_create(RoomKey::for_signal(SignalId(4)))
		.await
		.expect("create");

	for _ in 0..50 {
		if registry.live_rooms().await == 0 {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("fallback timer never destroyed the room");
}
