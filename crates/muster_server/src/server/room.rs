#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use muster_domain::{ChatMessage, RoomKey, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::store::Store;
use crate::util::time::unix_ms_now;

/// Per-client delivery handle registered with a room.
#[derive(Debug, Clone)]
pub struct ClientHandle {
	pub user_id: UserId,
	pub username: String,
	pub sender: mpsc::Sender<ChatMessage>,
}

/// Events processed by a room actor, in arrival order.
#[derive(Debug)]
pub enum RoomEvent {
	Join(ClientHandle),
	Leave(UserId),
	Post(ChatMessage),
	Shutdown,
}

/// Handle to a running room actor. Cheap to clone; dropping every handle
/// does not stop the actor, `shutdown` does.
#[derive(Debug, Clone)]
pub struct RoomHandle {
	key: RoomKey,
	events: mpsc::Sender<RoomEvent>,
}

impl RoomHandle {
	#[allow(dead_code)]
	pub fn key(&self) -> RoomKey {
		self.key
	}

	pub async fn join(&self, client: ClientHandle) {
		self.send(RoomEvent::Join(client)).await;
	}

	pub async fn leave(&self, user: UserId) {
		self.send(RoomEvent::Leave(user)).await;
	}

	pub async fn post(&self, message: ChatMessage) {
		self.send(RoomEvent::Post(message)).await;
	}

	pub async fn shutdown(&self) {
		self.send(RoomEvent::Shutdown).await;
	}

	async fn send(&self, event: RoomEvent) {
		if self.events.send(event).await.is_err() {
			debug!(room = %self.key, "room actor already stopped");
		}
	}
}

/// Room actor: owns the participant map, serializes joins, leaves, and
/// broadcasts. Nothing else touches the map, so no lock is needed.
pub struct RoomActor {
	key: RoomKey,
	store: Arc<dyn Store>,
	events: mpsc::Receiver<RoomEvent>,
	participants: HashMap<UserId, ClientHandle>,
	client_queue_capacity: usize,
}

impl RoomActor {
	/// Spawn an actor for `key` and return its handle plus the join handle
	/// of the driving task.
	pub fn spawn(
		key: RoomKey,
		store: Arc<dyn Store>,
		event_queue_capacity: usize,
		client_queue_capacity: usize,
	) -> (RoomHandle, JoinHandle<()>) {
		let (tx, rx) = mpsc::channel(event_queue_capacity);
		let actor = RoomActor {
			key,
			store,
			events: rx,
			participants: HashMap::new(),
			client_queue_capacity,
		};

		let task = tokio::spawn(actor.run());
		(RoomHandle { key, events: tx }, task)
	}

	async fn run(mut self) {
		debug!(room = %self.key, "room actor started");

		while let Some(event) = self.events.recv().await {
			match event {
				RoomEvent::Join(client) => self.handle_join(client),
				RoomEvent::Leave(user) => self.handle_leave(user),
				RoomEvent::Post(message) => self.handle_post(message),
				RoomEvent::Shutdown => break,
			}
		}

		// Dropping the senders closes every client channel, which the
		// connection writers observe as end-of-stream.
		self.participants.clear();
		metrics::counter!("muster_rooms_stopped_total").increment(1);
		debug!(room = %self.key, "room actor stopped");
	}

	fn handle_join(&mut self, client: ClientHandle) {
		let user = client.user_id;
		let username = client.username.clone();

		// Last writer wins: a reconnect replaces the stale handle and the
		// old connection's channel closes.
		if self.participants.insert(user, client).is_some() {
			debug!(room = %self.key, user = user.0, "replaced existing participant handle");
		}

		metrics::gauge!("muster_room_participants", "room" => self.key.to_string())
			.set(self.participants.len() as f64);

		self.broadcast_system(format!("{username} joined"));
	}

	fn handle_leave(&mut self, user: UserId) {
		let Some(client) = self.participants.remove(&user) else {
			// Already evicted or never joined.
			return;
		};

		metrics::gauge!("muster_room_participants", "room" => self.key.to_string())
			.set(self.participants.len() as f64);

		self.broadcast_system(format!("{} left", client.username));
	}

	fn handle_post(&mut self, message: ChatMessage) {
		self.persist(&message);
		self.broadcast(message);
	}

	/// Join/leave announcements are ephemeral: broadcast to live
	/// participants, never written to the message log.
	fn broadcast_system(&mut self, content: String) {
		let message = ChatMessage::system(self.key, content, unix_ms_now());
		self.broadcast(message);
	}

	/// Persist off the broadcast path. A failed write is logged and the
	/// message is still delivered.
	fn persist(&self, message: &ChatMessage) {
		let store = Arc::clone(&self.store);
		let room = self.key;
		let author = message.author();
		let kind = message.kind;
		let content = message.content.clone();
		let created_at_ms = message.timestamp;

		tokio::spawn(async move {
			match store.create_message(room, author, kind, &content, created_at_ms).await {
				Ok(id) => debug!(room = %room, id, "message persisted"),
				Err(err) => warn!(room = %room, error = %err, "message persist failed; continuing"),
			}
		});
	}

	/// Fan out to every participant without blocking the event loop. A
	/// participant whose queue is full is evicted; others are unaffected.
	fn broadcast(&mut self, message: ChatMessage) {
		let mut evicted: Vec<UserId> = Vec::new();

		for (user, client) in &self.participants {
			match client.sender.try_send(message.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(
						room = %self.key,
						user = user.0,
						capacity = self.client_queue_capacity,
						"participant queue full, evicting"
					);
					metrics::counter!("muster_room_evictions_total", "room" => self.key.to_string()).increment(1);
					evicted.push(*user);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					evicted.push(*user);
				}
			}
		}

		for user in evicted {
			self.participants.remove(&user);
		}

		metrics::gauge!("muster_room_participants", "room" => self.key.to_string())
			.set(self.participants.len() as f64);
	}
}
