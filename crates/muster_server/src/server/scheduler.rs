#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use muster_queue::{ExpireChatRoomPayload, ExpireSignalPayload, Job, JobPayload, JobQueue, UpdateMannerScorePayload};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::store::Store;
use crate::util::time::{ms_to_unix_secs, unix_ms_now};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	pub expired_signals_interval: Duration,
	pub rooms_interval: Duration,
	pub manner_scores_interval: Duration,
	pub promote_interval: Duration,
	/// How long a room outlives its signal's scheduled time.
	pub room_grace: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			expired_signals_interval: Duration::from_secs(60),
			rooms_interval: Duration::from_secs(300),
			manner_scores_interval: Duration::from_secs(3600),
			promote_interval: Duration::from_secs(60),
			room_grace: Duration::from_secs(24 * 3600),
		}
	}
}

/// Periodic sweeps that turn database state into queued jobs. Every tick
/// is idempotent: a sweep that runs twice enqueues work whose handlers
/// tolerate replay.
#[derive(Clone)]
pub struct Scheduler {
	store: Arc<dyn Store>,
	queue: JobQueue,
	cfg: SchedulerConfig,
}

impl Scheduler {
	pub fn new(store: Arc<dyn Store>, queue: JobQueue, cfg: SchedulerConfig) -> Self {
		Self { store, queue, cfg }
	}

	/// Enqueue an expiration job for every signal past its deadline.
	pub async fn tick_expired_signals(&self) -> anyhow::Result<usize> {
		let expired = self.store.list_expired_signals(unix_ms_now()).await?;

		for signal in &expired {
			let job = Job::new(JobPayload::ExpireSignal(ExpireSignalPayload { signal_id: signal.id }));
			self.queue.enqueue(&job).await?;
			debug!(signal = signal.id.0, "signal expiration queued");
		}

		if !expired.is_empty() {
			metrics::counter!("muster_scheduler_signals_expired_total").increment(expired.len() as u64);
		}
		Ok(expired.len())
	}

	/// Create rooms for signals that filled up, and queue teardown for
	/// rooms past their deadline.
	pub async fn tick_rooms(&self) -> anyhow::Result<usize> {
		let mut touched = 0usize;

		for signal in self.store.list_full_unroomed_signals().await? {
			let expires_at_ms = signal.scheduled_at_ms + self.cfg.room_grace.as_millis() as i64;
			let room_id = self
				.store
				.create_chat_room(signal.id, &signal.title, expires_at_ms)
				.await?;
			self.queue
				.schedule_chat_room_expiration(room_id, ms_to_unix_secs(expires_at_ms))
				.await?;

			let mut recipients = self.store.approved_participants(signal.id).await?;
			if !recipients.contains(&signal.creator_id) {
				recipients.push(signal.creator_id);
			}
			self.queue
				.push_notification(
					recipients,
					"Your meetup chat room is open",
					format!("The chat room for \"{}\" is ready.", signal.title),
					BTreeMap::from([("signal_id".to_string(), signal.id.0.to_string())]),
				)
				.await?;

			info!(signal = signal.id.0, room_id, expires_at_ms, "chat room created");
			touched += 1;
		}

		// Catches rooms whose delayed teardown job was lost.
		for room in self.store.list_expired_rooms(unix_ms_now()).await? {
			let job = Job::new(JobPayload::ExpireChatRoom(ExpireChatRoomPayload { chat_room_id: room.id }));
			self.queue.enqueue(&job).await?;
			debug!(room_id = room.id, "overdue room teardown queued");
			touched += 1;
		}

		Ok(touched)
	}

	/// Queue one manner-score recomputation pass.
	pub async fn tick_manner_scores(&self) -> anyhow::Result<usize> {
		let job = Job::new(JobPayload::UpdateMannerScore(UpdateMannerScorePayload {}));
		self.queue.enqueue(&job).await?;
		Ok(1)
	}

	/// Move due delayed jobs onto their ready queues.
	pub async fn tick_promote(&self) -> anyhow::Result<usize> {
		Ok(self.queue.promote_due().await? as usize)
	}

	/// Spawn the four periodic loops. Each runs until `cancel` fires and
	/// logs-and-continues on errors.
	pub fn spawn(self, cancel: CancellationToken) {
		spawn_loop("expired_signals", self.cfg.expired_signals_interval, cancel.clone(), {
			let scheduler = self.clone();
			move || {
				let scheduler = scheduler.clone();
				async move { scheduler.tick_expired_signals().await }
			}
		});

		spawn_loop("rooms", self.cfg.rooms_interval, cancel.clone(), {
			let scheduler = self.clone();
			move || {
				let scheduler = scheduler.clone();
				async move { scheduler.tick_rooms().await }
			}
		});

		spawn_loop("manner_scores", self.cfg.manner_scores_interval, cancel.clone(), {
			let scheduler = self.clone();
			move || {
				let scheduler = scheduler.clone();
				async move { scheduler.tick_manner_scores().await }
			}
		});

		spawn_loop("promote_delayed", self.cfg.promote_interval, cancel, {
			let scheduler = self.clone();
			move || {
				let scheduler = scheduler.clone();
				async move { scheduler.tick_promote().await }
			}
		});
	}
}

fn spawn_loop<F, Fut>(name: &'static str, interval: Duration, cancel: CancellationToken, mut tick: F)
where
	F: FnMut() -> Fut + Send + 'static,
	Fut: Future<Output = anyhow::Result<usize>> + Send,
{
	tokio::spawn(async move {
		let mut timer = tokio::time::interval(interval);
		timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		timer.tick().await; // immediate first tick belongs to startup

		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					debug!(loop_name = name, "scheduler loop stopped");
					break;
				}
				_ = timer.tick() => {
					match tick().await {
						Ok(n) if n > 0 => debug!(loop_name = name, items = n, "scheduler tick"),
						Ok(_) => {}
						Err(err) => warn!(loop_name = name, error = %err, "scheduler tick failed"),
					}
				}
			}
		}
	});
}
