#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use muster_domain::{SignalId, UserId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::{Job, JobPayload, JobType, PushNotificationPayload};
use crate::store::{OrderedStore, StoreError};

/// Sorted set of serialized jobs scored by due time (unix seconds).
const DELAYED_KEY: &str = "delayed_jobs";

/// List of jobs that exhausted their retry budget; held for inspection.
const DEAD_LETTER_KEY: &str = "failed_jobs";

fn ready_key(ty: JobType) -> String {
	format!("queue:{ty}")
}

fn now_unix_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}

/// Errors from queue operations. A failed operation never corrupts a job's
/// payload; the caller retries with its own backoff.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("job codec: {0}")]
	Codec(#[from] serde_json::Error),
}

/// What `retry` decided to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
	/// Re-scheduled to run after the backoff delay.
	Rescheduled { attempts: u32 },
	/// Retry ceiling reached; moved to the dead-letter list.
	DeadLettered,
}

/// Queue depths for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
	pub pending: u64,
	pub delayed: u64,
	pub failed: u64,
}

/// Generic enqueue/dequeue/schedule/retry primitive over the ordered store.
///
/// One ready list per job type avoids head-of-line blocking across
/// unrelated job types; the delayed set and dead-letter list are shared.
#[derive(Clone)]
pub struct JobQueue {
	store: Arc<dyn OrderedStore>,
}

impl JobQueue {
	pub fn new(store: Arc<dyn OrderedStore>) -> Self {
		Self { store }
	}

	/// Append a job to its type's ready list.
	pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
		let encoded = serde_json::to_string(job)?;
		self.store.push_front(&ready_key(job.job_type()), encoded).await?;
		metrics::counter!("muster_queue_jobs_enqueued_total", "type" => job.job_type().as_str()).increment(1);
		Ok(())
	}

	/// Store a job in the delayed set, due at `at_unix_secs`.
	pub async fn schedule(&self, job: &Job, at_unix_secs: i64) -> Result<(), QueueError> {
		let encoded = serde_json::to_string(job)?;
		self.store.zadd(DELAYED_KEY, encoded, at_unix_secs as f64).await?;
		metrics::counter!("muster_queue_jobs_scheduled_total", "type" => job.job_type().as_str()).increment(1);
		Ok(())
	}

	/// Blocking pop from one type's ready list. `Ok(None)` on timeout, so
	/// consumers stay responsive to cancellation. Pop is destructive.
	pub async fn dequeue(&self, ty: JobType, timeout: Duration) -> Result<Option<Job>, QueueError> {
		let Some(encoded) = self.store.pop_back_blocking(&ready_key(ty), timeout).await? else {
			return Ok(None);
		};

		let job: Job = serde_json::from_str(&encoded)?;
		Ok(Some(job))
	}

	/// Move every delayed entry whose due time has passed to its ready
	/// list. Each entry is claimed by removing it from the delayed set
	/// first, so concurrent sweeps promote any given entry exactly once;
	/// losing the claim race is a silent no-op. If the push fails after a
	/// claim, the entry is put back at its original score, so a store
	/// failure delays the job instead of losing it.
	pub async fn promote_due(&self) -> Result<u64, QueueError> {
		let due = self.store.zrange_by_score(DELAYED_KEY, now_unix_secs() as f64).await?;

		let mut promoted = 0u64;
		for (encoded, score) in due {
			if !self.store.zrem(DELAYED_KEY, &encoded).await? {
				continue;
			}

			let job: Job = match serde_json::from_str(&encoded) {
				Ok(job) => job,
				Err(e) => {
					warn!(error = %e, "dropping undecodable delayed entry");
					continue;
				}
			};

			if let Err(push_err) = self.store.push_front(&ready_key(job.job_type()), encoded.clone()).await {
				if let Err(restore_err) = self.store.zadd(DELAYED_KEY, encoded, score).await {
					warn!(id = %job.id, error = %restore_err, "claimed entry could not be returned to the delayed set");
				}
				return Err(push_err.into());
			}
			promoted += 1;
		}

		if promoted > 0 {
			debug!(promoted, "promoted due jobs to ready lists");
			metrics::counter!("muster_queue_jobs_promoted_total").increment(promoted);
		}

		Ok(promoted)
	}

	/// Record a handler failure. Below the ceiling the job is re-scheduled
	/// after `backoff`; at the ceiling it is moved verbatim to the
	/// dead-letter list. A job is never silently dropped.
	pub async fn retry(&self, job: &mut Job, backoff: Duration) -> Result<RetryOutcome, QueueError> {
		job.attempts += 1;

		if job.attempts >= job.max_retries {
			let encoded = serde_json::to_string(job)?;
			self.store.push_front(DEAD_LETTER_KEY, encoded).await?;
			metrics::counter!("muster_queue_jobs_dead_lettered_total", "type" => job.job_type().as_str()).increment(1);
			warn!(id = %job.id, ty = %job.job_type(), attempts = job.attempts, "job dead-lettered");
			return Ok(RetryOutcome::DeadLettered);
		}

		let retry_at = now_unix_secs() + backoff.as_secs() as i64;
		self.schedule(job, retry_at).await?;
		metrics::counter!("muster_queue_jobs_retried_total", "type" => job.job_type().as_str()).increment(1);
		Ok(RetryOutcome::Rescheduled { attempts: job.attempts })
	}

	/// Snapshot of the dead-letter list for operator inspection.
	pub async fn dead_letters(&self) -> Result<Vec<Job>, QueueError> {
		let entries = self.store.list_all(DEAD_LETTER_KEY).await?;
		let mut jobs = Vec::with_capacity(entries.len());
		for encoded in entries {
			jobs.push(serde_json::from_str(&encoded)?);
		}
		Ok(jobs)
	}

	pub async fn stats(&self, ty: JobType) -> Result<QueueStats, QueueError> {
		Ok(QueueStats {
			pending: self.store.list_len(&ready_key(ty)).await?,
			delayed: self.store.zcard(DELAYED_KEY).await?,
			failed: self.store.list_len(DEAD_LETTER_KEY).await?,
		})
	}

	/// Enqueue an immediate push notification job.
	pub async fn push_notification(
		&self,
		user_ids: Vec<UserId>,
		title: impl Into<String>,
		body: impl Into<String>,
		data: BTreeMap<String, String>,
	) -> Result<(), QueueError> {
		let job = Job::new(JobPayload::SendPushNotification(PushNotificationPayload {
			user_ids,
			title: title.into(),
			body: body.into(),
			data,
		}));
		self.enqueue(&job).await
	}

	/// Schedule a signal to expire at `at_unix_secs`.
	pub async fn schedule_signal_expiration(&self, signal_id: SignalId, at_unix_secs: i64) -> Result<(), QueueError> {
		let job = Job::new(JobPayload::ExpireSignal(crate::job::ExpireSignalPayload { signal_id }));
		self.schedule(&job, at_unix_secs).await
	}

	/// Schedule a chat room teardown at `at_unix_secs`.
	pub async fn schedule_chat_room_expiration(&self, chat_room_id: i64, at_unix_secs: i64) -> Result<(), QueueError> {
		let job = Job::new(JobPayload::ExpireChatRoom(crate::job::ExpireChatRoomPayload { chat_room_id }));
		self.schedule(&job, at_unix_secs).await
	}
}
