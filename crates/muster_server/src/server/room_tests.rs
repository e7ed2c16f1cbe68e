#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use muster_domain::{ChatMessage, MessageType, RoomKey, SignalId, UserId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::room::{ClientHandle, RoomActor, RoomHandle};
use crate::server::store::{MemoryStore, Store};
use crate::util::time::unix_ms_now;

const ROOM_SIGNAL: SignalId = SignalId(1);

async fn spawn_room(client_queue_capacity: usize) -> (RoomHandle, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	store
		.create_chat_room(ROOM_SIGNAL, "test room", unix_ms_now() + 3_600_000)
		.await
		.expect("room row");

	let key = RoomKey::for_signal(ROOM_SIGNAL);
	let (handle, _task) = RoomActor::spawn(key, store.clone() as Arc<dyn Store>, 64, client_queue_capacity);
	(handle, store)
}

fn client(user: u64, name: &str, capacity: usize) -> (ClientHandle, mpsc::Receiver<ChatMessage>) {
	let (tx, rx) = mpsc::channel(capacity);
	(
		ClientHandle {
			user_id: UserId(user),
			username: name.to_string(),
			sender: tx,
		},
		rx,
	)
}

async fn recv(rx: &mut mpsc::Receiver<ChatMessage>) -> ChatMessage {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected a message within timeout")
		.expect("channel open")
}

fn text_from(user: u64, name: &str, content: &str) -> ChatMessage {
	ChatMessage {
		id: 0,
		room_id: RoomKey::for_signal(ROOM_SIGNAL),
		user_id: UserId(user),
		username: name.to_string(),
		content: content.to_string(),
		kind: MessageType::Text,
		timestamp: unix_ms_now(),
	}
}

#[tokio::test]
async fn joins_announce_and_posts_reach_everyone() {
	let (room, store) = spawn_room(16).await;

	let (c1, mut rx1) = client(1, "ana", 16);
	let (c2, mut rx2) = client(2, "bo", 16);
	let (c3, mut rx3) = client(3, "cy", 16);

	room.join(c1).await;
	assert_eq!(recv(&mut rx1).await.content, "ana joined");

	room.join(c2).await;
	assert_eq!(recv(&mut rx1).await.content, "bo joined");
	assert_eq!(recv(&mut rx2).await.content, "bo joined");

	room.join(c3).await;
	assert_eq!(recv(&mut rx1).await.content, "cy joined");
	assert_eq!(recv(&mut rx2).await.content, "cy joined");
	assert_eq!(recv(&mut rx3).await.content, "cy joined");

	room.post(text_from(1, "ana", "hello")).await;
	for rx in [&mut rx1, &mut rx2, &mut rx3] {
		let got = recv(rx).await;
		assert_eq!(got.content, "hello");
		assert_eq!(got.user_id, UserId(1));
		assert_eq!(got.kind, MessageType::Text);
	}

	// Persistence is off the broadcast path; poll until the write lands.
	// Only the user message hits the log, the three join announcements
	// were broadcast-only.
	let key = RoomKey::for_signal(ROOM_SIGNAL);
	let mut persisted = Vec::new();
	for _ in 0..50 {
		persisted = store.list_messages(key, 100).await.expect("list");
		if !persisted.is_empty() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(persisted.len(), 1, "only the user message is persisted");
	assert_eq!(persisted[0].kind, MessageType::Text);
	assert_eq!(persisted[0].content, "hello");
	assert_eq!(persisted[0].author, Some(UserId(1)));

	// A later snapshot must not pick up stray announcement rows.
	tokio::time::sleep(Duration::from_millis(50)).await;
	let settled = store.list_messages(key, 100).await.expect("list");
	assert_eq!(settled.len(), 1);
}

#[tokio::test]
async fn saturated_participant_is_evicted_without_affecting_others() {
	let (room, _store) = spawn_room(16).await;

	// Slow client can buffer exactly one message and never drains it.
	let (slow, mut slow_rx) = client(1, "slow", 1);
	let (fast, mut fast_rx) = client(2, "fast", 16);

	room.join(slow).await;
	room.join(fast).await;

	// "slow joined" filled slow's queue; "fast joined" overflowed it.
	assert_eq!(recv(&mut fast_rx).await.content, "fast joined");

	room.post(text_from(2, "fast", "still here")).await;
	assert_eq!(recv(&mut fast_rx).await.content, "still here");

	// The evicted client's channel closes once its sender is dropped.
	assert_eq!(recv(&mut slow_rx).await.content, "slow joined");
	let closed = timeout(Duration::from_millis(500), slow_rx.recv()).await;
	assert_eq!(closed.expect("timely close"), None);
}

#[tokio::test]
async fn leaving_twice_or_unknown_is_a_noop() {
	let (room, _store) = spawn_room(16).await;

	let (c1, mut rx1) = client(1, "ana", 16);
	room.join(c1).await;
	assert_eq!(recv(&mut rx1).await.content, "ana joined");

	// Unknown user: no announcement.
	room.leave(UserId(99)).await;
	let quiet = timeout(Duration::from_millis(100), rx1.recv()).await;
	assert!(quiet.is_err(), "no broadcast expected for unknown leave");

	room.leave(UserId(1)).await;
	let closed = timeout(Duration::from_millis(500), rx1.recv()).await;
	assert_eq!(closed.expect("timely close"), None);

	// Second leave after removal must not panic or announce.
	room.leave(UserId(1)).await;
}

#[tokio::test]
async fn reconnect_replaces_the_stale_handle() {
	let (room, _store) = spawn_room(16).await;

	let (first, mut first_rx) = client(1, "ana", 16);
	let (second, mut second_rx) = client(1, "ana", 16);

	room.join(first).await;
	assert_eq!(recv(&mut first_rx).await.content, "ana joined");

	room.join(second).await;
	// The replacement closes the old channel; only the new one stays live.
	assert_eq!(recv(&mut second_rx).await.content, "ana joined");

	room.post(text_from(1, "ana", "back")).await;
	assert_eq!(recv(&mut second_rx).await.content, "back");

	loop {
		match timeout(Duration::from_millis(500), first_rx.recv()).await {
			Ok(Some(_)) => continue, // drain whatever landed before the swap
			Ok(None) => break,
			Err(_) => panic!("old channel should close after replacement"),
		}
	}
}

#[tokio::test]
async fn shutdown_closes_every_participant() {
	let (room, _store) = spawn_room(16).await;

	let (c1, mut rx1) = client(1, "ana", 16);
	let (c2, mut rx2) = client(2, "bo", 16);
	room.join(c1).await;
	room.join(c2).await;

	room.shutdown().await;

	for rx in [&mut rx1, &mut rx2] {
		loop {
			match timeout(Duration::from_millis(500), rx.recv()).await {
				Ok(Some(_)) => continue,
				Ok(None) => break,
				Err(_) => panic!("channel should close on shutdown"),
			}
		}
	}
}
