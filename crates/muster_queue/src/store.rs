#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Errors from the shared ordered store.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("redis: {0}")]
	Redis(#[from] redis::RedisError),
}

/// Boundary to the shared ordered store the queue is built on: type-keyed
/// lists with blocking pop, plus one time-ordered set for delayed entries.
///
/// The store is the only resource shared across process instances; every
/// operation here maps to a single atomic store command.
#[async_trait]
pub trait OrderedStore: Send + Sync {
	async fn push_front(&self, key: &str, value: String) -> Result<(), StoreError>;

	/// Destructive pop from the back of a list, blocking up to `timeout`.
	/// `Ok(None)` means the timeout elapsed with the list empty.
	async fn pop_back_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

	async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

	/// Non-destructive read of a whole list, front to back.
	async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

	async fn zadd(&self, key: &str, member: String, score: f64) -> Result<(), StoreError>;

	/// Members with score `<= max`, ascending, paired with their scores.
	async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<(String, f64)>, StoreError>;

	/// Remove a member; `Ok(false)` if it was not present.
	async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

	async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
}

/// Redis-backed ordered store using an auto-reconnecting connection manager.
#[derive(Clone)]
pub struct RedisStore {
	conn: redis::aio::ConnectionManager,
}

impl RedisStore {
	pub async fn connect(url: &str) -> Result<Self, StoreError> {
		let client = redis::Client::open(url)?;
		let conn = client.get_connection_manager().await?;
		Ok(Self { conn })
	}
}

#[async_trait]
impl OrderedStore for RedisStore {
	async fn push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
		let mut conn = self.conn.clone();
		let _: () = conn.lpush(key, value).await?;
		Ok(())
	}

	async fn pop_back_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
		let mut conn = self.conn.clone();
		let popped: Option<(String, String)> = conn.brpop(key, timeout.as_secs_f64()).await?;
		Ok(popped.map(|(_key, value)| value))
	}

	async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
		let mut conn = self.conn.clone();
		Ok(conn.llen(key).await?)
	}

	async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
		let mut conn = self.conn.clone();
		Ok(conn.lrange(key, 0, -1).await?)
	}

	async fn zadd(&self, key: &str, member: String, score: f64) -> Result<(), StoreError> {
		let mut conn = self.conn.clone();
		let _: () = conn.zadd(key, member, score).await?;
		Ok(())
	}

	async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<(String, f64)>, StoreError> {
		let mut conn = self.conn.clone();
		Ok(conn.zrangebyscore_withscores(key, "-inf", max).await?)
	}

	async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		let mut conn = self.conn.clone();
		let removed: u64 = conn.zrem(key, member).await?;
		Ok(removed > 0)
	}

	async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
		let mut conn = self.conn.clone();
		Ok(conn.zcard(key).await?)
	}
}

/// In-process ordered store with the same semantics, used in tests and in
/// single-process deployments without a configured Redis.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
	pushed: Notify,
}

#[derive(Default)]
struct MemoryInner {
	// Lists are pushed at the front and popped at the back.
	lists: HashMap<String, VecDeque<String>>,
	// Sorted sets kept ordered by (score, member).
	zsets: HashMap<String, Vec<(f64, String)>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl OrderedStore for MemoryStore {
	async fn push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
		{
			let mut inner = self.inner.lock().expect("memory store poisoned");
			inner.lists.entry(key.to_string()).or_default().push_front(value);
		}
		self.pushed.notify_waiters();
		Ok(())
	}

	async fn pop_back_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
		let deadline = Instant::now() + timeout;

		loop {
			let notified = self.pushed.notified();
			tokio::pin!(notified);

			{
				let mut inner = self.inner.lock().expect("memory store poisoned");
				if let Some(list) = inner.lists.get_mut(key)
					&& let Some(value) = list.pop_back()
				{
					return Ok(Some(value));
				}
			}

			tokio::select! {
				_ = &mut notified => {}
				_ = tokio::time::sleep_until(deadline) => return Ok(None),
			}
		}
	}

	async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
		let inner = self.inner.lock().expect("memory store poisoned");
		Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
	}

	async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
		let inner = self.inner.lock().expect("memory store poisoned");
		Ok(inner.lists.get(key).map(|l| l.iter().cloned().collect()).unwrap_or_default())
	}

	async fn zadd(&self, key: &str, member: String, score: f64) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().expect("memory store poisoned");
		let set = inner.zsets.entry(key.to_string()).or_default();
		set.retain(|(_, m)| *m != member);
		set.push((score, member));
		set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
		Ok(())
	}

	async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<(String, f64)>, StoreError> {
		let inner = self.inner.lock().expect("memory store poisoned");
		Ok(inner
			.zsets
			.get(key)
			.map(|set| {
				set.iter()
					.filter(|(score, _)| *score <= max)
					.map(|(score, member)| (member.clone(), *score))
					.collect()
			})
			.unwrap_or_default())
	}

	async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("memory store poisoned");
		let Some(set) = inner.zsets.get_mut(key) else {
			return Ok(false);
		};
		let before = set.len();
		set.retain(|(_, m)| m != member);
		Ok(set.len() != before)
	}

	async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
		let inner = self.inner.lock().expect("memory store poisoned");
		Ok(inner.zsets.get(key).map(|s| s.len() as u64).unwrap_or(0))
	}
}
