#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use muster_domain::{RoomKey, SignalId, UserId};
use muster_queue::{ExpireChatRoomPayload, Job, JobPayload, JobQueue, JobType, RetryOutcome};
use tokio_util::sync::CancellationToken;

use crate::server::notify::Notifier;
use crate::server::registry::{RegistryConfig, RoomRegistry};
use crate::server::store::{MemoryStore, SignalRecord, SignalStatus, Store};
use crate::server::worker::{WorkerConfig, WorkerCtx, handle_job, spawn_workers};
use crate::util::time::unix_ms_now;

/// Records deliveries; fails the first `fail_first` push attempts.
#[derive(Default)]
struct RecordingNotifier {
	fail_first: AtomicU32,
	pushes: Mutex<Vec<String>>,
	emails: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
	async fn deliver_push(
		&self,
		_user_ids: &[UserId],
		title: &str,
		_body: &str,
		_data: &BTreeMap<String, String>,
	) -> anyhow::Result<()> {
		if self.fail_first.load(Ordering::SeqCst) > 0 {
			self.fail_first.fetch_sub(1, Ordering::SeqCst);
			anyhow::bail!("transport unavailable");
		}
		self.pushes.lock().expect("lock").push(title.to_string());
		Ok(())
	}

	async fn deliver_email(
		&self,
		to: &str,
		_subject: &str,
		_template: &str,
		_data: &BTreeMap<String, String>,
	) -> anyhow::Result<()> {
		self.emails.lock().expect("lock").push(to.to_string());
		Ok(())
	}
}

fn signal(id: u64) -> SignalRecord {
	SignalRecord {
		id: SignalId(id),
		title: format!("signal {id}"),
		status: SignalStatus::Full,
		creator_id: UserId(1),
		scheduled_at_ms: unix_ms_now() + 60_000,
		expires_at_ms: unix_ms_now() + 60_000,
		current_participants: 4,
		max_participants: 4,
	}
}

fn ctx(store: Arc<MemoryStore>, notifier: Arc<RecordingNotifier>) -> (WorkerCtx, CancellationToken) {
	let queue = JobQueue::new(Arc::new(muster_queue::MemoryStore::new()));
	let cancel = CancellationToken::new();
	let registry = RoomRegistry::new(
		Arc::clone(&store) as Arc<dyn Store>,
		queue.clone(),
		RegistryConfig::default(),
		cancel.clone(),
	);

	(
		WorkerCtx {
			store: store as Arc<dyn Store>,
			queue,
			registry,
			notifier,
		},
		cancel,
	)
}

#[tokio::test]
async fn expire_room_job_tears_down_row_and_live_actor() {
	let store = Arc::new(MemoryStore::new());
	store.insert_signal(signal(1));
	let room_id = store
		.create_chat_room(SignalId(1), "signal 1", unix_ms_now() + 60_000)
		.await
		.expect("room row");
	let notifier = Arc::new(RecordingNotifier::default());
	let (ctx, _cancel) = ctx(store, notifier);

	let key = RoomKey::for_signal(SignalId(1));
	ctx.registry.get_or_create(key).await.expect("live room");
	assert_eq!(ctx.registry.live_rooms().await, 1);

	let job = Job::new(JobPayload::ExpireChatRoom(ExpireChatRoomPayload { chat_room_id: room_id }));
	handle_job(&ctx, &job).await.expect("handle");

	assert_eq!(ctx.registry.live_rooms().await, 0);
	let row = ctx.store.find_room(room_id).await.expect("lookup").expect("row kept");
	assert_eq!(row.status, crate::server::store::RoomStatus::Expired);

	// Replaying the same job is harmless.
	handle_job(&ctx, &job).await.expect("replay");
}

#[tokio::test]
async fn expire_room_job_for_missing_row_is_a_noop() {
	let store = Arc::new(MemoryStore::new());
	let notifier = Arc::new(RecordingNotifier::default());
	let (ctx, _cancel) = ctx(store, notifier);

	let job = Job::new(JobPayload::ExpireChatRoom(ExpireChatRoomPayload { chat_room_id: 12345 }));
	handle_job(&ctx, &job).await.expect("no row, no error");
}

#[tokio::test]
async fn expire_signal_job_closes_the_signal() {
	let store = Arc::new(MemoryStore::new());
	store.insert_signal(signal(2));
	let notifier = Arc::new(RecordingNotifier::default());
	let (ctx, _cancel) = ctx(Arc::clone(&store), notifier);

	let job = Job::new(JobPayload::ExpireSignal(muster_queue::ExpireSignalPayload {
		signal_id: SignalId(2),
	}));
	handle_job(&ctx, &job).await.expect("handle");

	let record = store.find_signal(SignalId(2)).await.expect("lookup").expect("present");
	assert_eq!(record.status, SignalStatus::Closed);
}

#[tokio::test]
async fn manner_score_job_updates_profiles() {
	let store = Arc::new(MemoryStore::new());
	store.insert_rating(UserId(7), 4, true, unix_ms_now());
	let notifier = Arc::new(RecordingNotifier::default());
	let (ctx, _cancel) = ctx(Arc::clone(&store), notifier);

	let job = Job::new(JobPayload::UpdateMannerScore(muster_queue::UpdateMannerScorePayload {}));
	handle_job(&ctx, &job).await.expect("handle");

	assert_eq!(store.manner_score_of(UserId(7)), Some(3.5));
}

#[tokio::test]
async fn worker_loop_drains_queued_pushes() {
	let store = Arc::new(MemoryStore::new());
	let notifier = Arc::new(RecordingNotifier::default());
	let (ctx, cancel) = ctx(store, Arc::clone(&notifier));

	ctx.queue
		.push_notification(vec![UserId(1)], "room open", "come on in", BTreeMap::new())
		.await
		.expect("enqueue");

	spawn_workers(
		ctx,
		WorkerConfig {
			pop_timeout: Duration::from_millis(100),
			..WorkerConfig::default()
		},
		cancel.clone(),
	);

	let mut delivered = false;
	for _ in 0..50 {
		if notifier.pushes.lock().expect("lock").contains(&"room open".to_string()) {
			delivered = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	cancel.cancel();
	assert!(delivered, "queued push never reached the notifier");
}

#[tokio::test]
async fn transient_failures_are_retried_then_forgotten_on_success() {
	let store = Arc::new(MemoryStore::new());
	let notifier = Arc::new(RecordingNotifier {
		fail_first: AtomicU32::new(2),
		..RecordingNotifier::default()
	});
	let (ctx, _cancel) = ctx(store, Arc::clone(&notifier));

	ctx.queue
		.push_notification(vec![UserId(1)], "flaky", String::new(), BTreeMap::new())
		.await
		.expect("enqueue");

	// Drive the pop/handle/retry cycle by hand with a zero backoff so
	// rescheduled jobs promote immediately.
	let mut final_attempts = 0;
	for _ in 0..5 {
		let mut job = ctx
			.queue
			.dequeue(JobType::SendPushNotification, Duration::from_millis(100))
			.await
			.expect("dequeue")
			.expect("job present");

		if handle_job(&ctx, &job).await.is_ok() {
			final_attempts = job.attempts;
			break;
		}

		assert!(matches!(
			ctx.queue.retry(&mut job, Duration::ZERO).await.expect("retry"),
			RetryOutcome::Rescheduled { .. }
		));
		ctx.queue.promote_due().await.expect("promote");
	}

	assert_eq!(final_attempts, 2, "two transient failures before success");
	assert_eq!(notifier.pushes.lock().expect("lock").as_slice(), ["flaky"]);
	assert!(ctx.queue.dead_letters().await.expect("dead letters").is_empty());
	assert!(
		ctx.queue
			.dequeue(JobType::SendPushNotification, Duration::from_millis(50))
			.await
			.expect("dequeue")
			.is_none(),
		"a succeeded job must not be requeued"
	);
}

#[tokio::test]
async fn failing_job_walks_the_retry_ladder_into_the_dead_letter_list() {
	let store = Arc::new(MemoryStore::new());
	let notifier = Arc::new(RecordingNotifier {
		fail_first: AtomicU32::new(u32::MAX),
		..RecordingNotifier::default()
	});
	let (ctx, _cancel) = ctx(store, notifier);

	let mut job = Job::new(JobPayload::SendPushNotification(muster_queue::PushNotificationPayload {
		user_ids: vec![UserId(1)],
		title: "doomed".to_string(),
		body: String::new(),
		data: BTreeMap::new(),
	}));

	let backoff = Duration::from_secs(30);
	for expected_attempts in 1..3 {
		handle_job(&ctx, &job).await.expect_err("handler fails");
		match ctx.queue.retry(&mut job, backoff).await.expect("retry") {
			RetryOutcome::Rescheduled { attempts } => assert_eq!(attempts, expected_attempts),
			RetryOutcome::DeadLettered => panic!("dead-lettered before the ceiling"),
		}
	}

	handle_job(&ctx, &job).await.expect_err("handler fails");
	assert!(matches!(
		ctx.queue.retry(&mut job, backoff).await.expect("retry"),
		RetryOutcome::DeadLettered
	));

	let dead = ctx.queue.dead_letters().await.expect("dead letters");
	assert_eq!(dead.len(), 1);
	assert_eq!(dead[0].attempts, 3);
	assert!(
		ctx.queue
			.dequeue(JobType::SendPushNotification, Duration::from_millis(50))
			.await
			.expect("dequeue")
			.is_none(),
		"dead-lettered job must not be requeued"
	);
}
