#![forbid(unsafe_code)]

//! Delayed/retriable job queue over a shared ordered store.
//!
//! Every deferred side effect in the system (push notifications, email,
//! signal expiry, chat room teardown, score recomputation) flows through
//! this crate. Execution is at-least-once with bounded retries; a popped
//! job that is lost to a crash is an accepted at-most-once gap, which is
//! why every handler must be idempotent.

pub mod job;
pub mod queue;
pub mod store;

pub use job::{
	DEFAULT_MAX_RETRIES, EmailPayload, ExpireChatRoomPayload, ExpireSignalPayload, Job, JobPayload, JobType,
	PushNotificationPayload, UpdateMannerScorePayload,
};
pub use queue::{JobQueue, QueueError, QueueStats, RetryOutcome};
pub use store::{MemoryStore, OrderedStore, RedisStore, StoreError};
