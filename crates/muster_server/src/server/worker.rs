#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use muster_domain::RoomKey;
use muster_queue::{Job, JobPayload, JobQueue, JobType, RetryOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::notify::Notifier;
use crate::server::registry::RoomRegistry;
use crate::server::store::Store;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
	/// Blocking-pop timeout per poll.
	pub pop_timeout: Duration,
	pub push_backoff: Duration,
	pub email_backoff: Duration,
	pub room_backoff: Duration,
	/// Backoff for everything without a dedicated knob.
	pub misc_backoff: Duration,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			pop_timeout: Duration::from_secs(5),
			push_backoff: Duration::from_secs(30),
			email_backoff: Duration::from_secs(60),
			room_backoff: Duration::from_secs(300),
			misc_backoff: Duration::from_secs(60),
		}
	}
}

impl WorkerConfig {
	fn backoff_for(&self, ty: JobType) -> Duration {
		match ty {
			JobType::SendPushNotification => self.push_backoff,
			JobType::SendEmail => self.email_backoff,
			JobType::ExpireChatRoom => self.room_backoff,
			JobType::ExpireSignal | JobType::UpdateMannerScore => self.misc_backoff,
		}
	}
}

/// Shared dependencies of every job handler.
#[derive(Clone)]
pub struct WorkerCtx {
	pub store: Arc<dyn Store>,
	pub queue: JobQueue,
	pub registry: RoomRegistry,
	pub notifier: Arc<dyn Notifier>,
}

/// Spawn one polling loop per job type.
pub fn spawn_workers(ctx: WorkerCtx, cfg: WorkerConfig, cancel: CancellationToken) {
	for ty in JobType::ALL {
		let ctx = ctx.clone();
		let cfg = cfg.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			run_worker(ty, ctx, cfg, cancel).await;
		});
	}
}

async fn run_worker(ty: JobType, ctx: WorkerCtx, cfg: WorkerConfig, cancel: CancellationToken) {
	debug!(job_type = %ty, "worker started");

	loop {
		let popped = tokio::select! {
			_ = cancel.cancelled() => break,
			popped = ctx.queue.dequeue(ty, cfg.pop_timeout) => popped,
		};

		let mut job = match popped {
			Ok(Some(job)) => job,
			Ok(None) => continue,
			Err(err) => {
				warn!(job_type = %ty, error = %err, "dequeue failed");
				tokio::time::sleep(Duration::from_secs(1)).await;
				continue;
			}
		};

		match handle_job(&ctx, &job).await {
			Ok(()) => {
				metrics::counter!("muster_worker_jobs_ok_total", "type" => ty.as_str()).increment(1);
				debug!(job_type = %ty, job_id = %job.id, "job done");
			}
			Err(err) => {
				metrics::counter!("muster_worker_jobs_failed_total", "type" => ty.as_str()).increment(1);
				warn!(job_type = %ty, job_id = %job.id, error = %err, "job failed");

				match ctx.queue.retry(&mut job, cfg.backoff_for(ty)).await {
					Ok(RetryOutcome::Rescheduled { attempts }) => {
						info!(job_id = %job.id, attempts, "job rescheduled");
					}
					Ok(RetryOutcome::DeadLettered) => {
						warn!(job_id = %job.id, "job dead-lettered");
					}
					Err(err) => warn!(job_id = %job.id, error = %err, "retry bookkeeping failed"),
				}
			}
		}
	}

	debug!(job_type = %ty, "worker stopped");
}

/// Execute one job. Handlers are idempotent: the queue may replay a job
/// after a crash between pop and completion.
pub async fn handle_job(ctx: &WorkerCtx, job: &Job) -> anyhow::Result<()> {
	match &job.payload {
		JobPayload::SendPushNotification(payload) => {
			ctx.notifier
				.deliver_push(&payload.user_ids, &payload.title, &payload.body, &payload.data)
				.await
		}
		JobPayload::SendEmail(payload) => {
			ctx.notifier
				.deliver_email(&payload.to, &payload.subject, &payload.template, &payload.data)
				.await
		}
		JobPayload::ExpireSignal(payload) => ctx.store.close_signal(payload.signal_id).await,
		JobPayload::ExpireChatRoom(payload) => {
			let Some(room) = ctx.store.find_room(payload.chat_room_id).await? else {
				// Row already gone; nothing to tear down.
				return Ok(());
			};

			if !ctx.store.expire_chat_room(room.id).await? {
				debug!(room_id = room.id, "room already expired");
			}

			let key = RoomKey::for_signal(room.signal_id);
			if ctx.registry.destroy(key).await {
				info!(room = %key, "live room torn down");
			}
			Ok(())
		}
		JobPayload::UpdateMannerScore(_) => {
			let updated = ctx
				.store
				.recompute_manner_scores(30 * 24 * 3600 * 1000)
				.await
				.map_err(|err| anyhow!("manner score recompute: {err}"))?;
			info!(updated, "manner scores recomputed");
			Ok(())
		}
	}
}
