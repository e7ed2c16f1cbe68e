#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use muster_domain::{RoomKey, SignalId};
use muster_queue::JobQueue;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::room::{RoomActor, RoomHandle};
use crate::server::store::Store;
use crate::util::time::{ms_to_unix_secs, unix_ms_now};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// How long a room outlives its signal's scheduled time.
	pub room_grace: Duration,
	/// Event queue depth of each room actor.
	pub room_queue_capacity: usize,
	/// Outbound queue depth per connected client.
	pub client_queue_capacity: usize,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			room_grace: Duration::from_secs(24 * 3600),
			room_queue_capacity: 256,
			client_queue_capacity: 256,
		}
	}
}

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("signal {0} not found")]
	SignalNotFound(SignalId),

	#[error(transparent)]
	Store(#[from] anyhow::Error),
}

/// Owns every live room actor, keyed by `RoomKey`. Rooms are created
/// lazily on first join and torn down by the expiration pipeline.
#[derive(Clone)]
pub struct RoomRegistry {
	inner: Arc<RwLock<HashMap<RoomKey, RoomHandle>>>,
	store: Arc<dyn Store>,
	queue: JobQueue,
	cfg: RegistryConfig,
	cancel: CancellationToken,
}

impl RoomRegistry {
	pub fn new(store: Arc<dyn Store>, queue: JobQueue, cfg: RegistryConfig, cancel: CancellationToken) -> Self {
		Self {
			inner: Arc::new(RwLock::new(HashMap::new())),
			store,
			queue,
			cfg,
			cancel,
		}
	}

	/// Return the room for `key`, spawning it if absent. Fails when the
	/// backing signal does not exist.
	pub async fn get_or_create(&self, key: RoomKey) -> Result<RoomHandle, RegistryError> {
		if let Some(handle) = self.inner.read().await.get(&key) {
			return Ok(handle.clone());
		}

		// Resolve the signal outside the write lock; the slow path must not
		// hold up unrelated rooms.
		let signal = self
			.store
			.find_signal(key.signal)
			.await?
			.ok_or(RegistryError::SignalNotFound(key.signal))?;
		let expires_at_ms = signal.scheduled_at_ms + self.cfg.room_grace.as_millis() as i64;

		let mut rooms = self.inner.write().await;
		// Double-checked: another connection may have won the race.
		if let Some(handle) = rooms.get(&key) {
			return Ok(handle.clone());
		}

		let (handle, _task) = RoomActor::spawn(
			key,
			Arc::clone(&self.store),
			self.cfg.room_queue_capacity,
			self.cfg.client_queue_capacity,
		);
		rooms.insert(key, handle.clone());
		info!(room = %key, expires_at_ms, "room spawned");
		metrics::gauge!("muster_rooms_live").set(rooms.len() as f64);
		drop(rooms);

		self.arm_expiry(key, expires_at_ms).await;

		Ok(handle)
	}

	/// Queue-driven teardown is canonical; the in-process timer is a
	/// fallback for deployments running without a queue backend.
	async fn arm_expiry(&self, key: RoomKey, expires_at_ms: i64) {
		match self.store.find_room_by_signal(key.signal).await {
			Ok(Some(room)) => {
				let at_secs = ms_to_unix_secs(room.expires_at_ms);
				if let Err(err) = self.queue.schedule_chat_room_expiration(room.id, at_secs).await {
					warn!(room = %key, error = %err, "failed to schedule room expiration job");
				}
			}
			Ok(None) => {}
			Err(err) => warn!(room = %key, error = %err, "room row lookup failed"),
		}

		let registry = self.clone();
		let cancel = self.cancel.clone();
		tokio::spawn(async move {
			let delay_ms = (expires_at_ms - unix_ms_now()).max(0) as u64;
			tokio::select! {
				_ = cancel.cancelled() => {}
				_ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
					if registry.destroy(key).await {
						debug!(room = %key, "room expired by fallback timer");
					}
				}
			}
		});
	}

	/// Stop and unregister a room. Returns `false` when no such room is
	/// live; repeat calls are no-ops.
	pub async fn destroy(&self, key: RoomKey) -> bool {
		let removed = self.inner.write().await.remove(&key);
		let Some(handle) = removed else {
			return false;
		};

		handle.shutdown().await;
		metrics::gauge!("muster_rooms_live").set(self.inner.read().await.len() as f64);
		info!(room = %key, "room destroyed");
		true
	}

	pub async fn destroy_all(&self) {
		let rooms: Vec<RoomHandle> = {
			let mut guard = self.inner.write().await;
			guard.drain().map(|(_, handle)| handle).collect()
		};

		for handle in rooms {
			handle.shutdown().await;
		}
		metrics::gauge!("muster_rooms_live").set(0.0);
	}

	pub async fn live_rooms(&self) -> usize {
		self.inner.read().await.len()
	}
}
