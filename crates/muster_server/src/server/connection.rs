#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use futures_util::{SinkExt as _, StreamExt as _};
use muster_domain::{ChatMessage, InboundFrame, RoomKey, UserId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::registry::{RegistryError, RoomRegistry};
use crate::server::room::ClientHandle;
use crate::server::store::Store;
use crate::util::time::unix_ms_now;

pub const WS_PATH_PREFIX: &str = "/ws/chat/";

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Ping cadence on the write side.
	pub keepalive_interval: Duration,
	/// Deadline for a single outbound frame.
	pub write_timeout: Duration,
	/// A peer that sends nothing (not even a pong) for this long is
	/// presumed dead and disconnected.
	pub read_timeout: Duration,
	/// Inbound text frames larger than this are dropped.
	pub max_frame_bytes: usize,
	/// Outbound queue depth; a slow client that fills it is evicted.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			keepalive_interval: Duration::from_secs(54),
			write_timeout: Duration::from_secs(10),
			read_timeout: Duration::from_secs(60),
			max_frame_bytes: 64 * 1024,
			outbound_queue_capacity: 256,
		}
	}
}

/// Identity and target extracted during the websocket handshake.
#[derive(Debug, Clone)]
struct HandshakeInfo {
	room: RoomKey,
	user_id: UserId,
	username: String,
}

fn reject(status: StatusCode) -> ErrorResponse {
	let mut resp = ErrorResponse::new(None);
	*resp.status_mut() = status;
	resp
}

fn parse_handshake(req: &Request) -> Result<HandshakeInfo, ErrorResponse> {
	let path = req.uri().path();
	let room: RoomKey = path
		.strip_prefix(WS_PATH_PREFIX)
		.and_then(|key| key.parse().ok())
		.ok_or_else(|| reject(StatusCode::NOT_FOUND))?;

	let header = |name: &str| {
		req.headers()
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
	};

	let user_id = header("x-user-id")
		.and_then(|v| v.parse::<u64>().ok())
		.filter(|id| *id != 0)
		.map(UserId)
		.ok_or_else(|| reject(StatusCode::UNAUTHORIZED))?;
	let username = header("x-username").ok_or_else(|| reject(StatusCode::UNAUTHORIZED))?;

	Ok(HandshakeInfo { room, user_id, username })
}

/// Drive one client connection: handshake, membership check, then the
/// read/write pumps until the peer leaves or the room is torn down.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	registry: RoomRegistry,
	store: Arc<dyn Store>,
	settings: ConnectionSettings,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	let mut handshake: Option<HandshakeInfo> = None;
	let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
		// Identity comes from gateway-injected headers; no headers, no
		// upgrade.
		handshake = Some(parse_handshake(req)?);
		Ok(resp)
	})
	.await
	.context("websocket handshake")?;

	let HandshakeInfo { room, user_id, username } = handshake.ok_or_else(|| anyhow!("handshake callback not run"))?;
	let (mut write, mut read) = ws.split();

	if !store.can_join(room.signal, user_id).await? {
		info!(conn_id, room = %room, user = user_id.0, "join refused: not a participant");
		let _ = write
			.send(Message::Close(Some(CloseFrame {
				code: CloseCode::Policy,
				reason: "not a participant".into(),
			})))
			.await;
		return Ok(());
	}

	let handle = match registry.get_or_create(room).await {
		Ok(handle) => handle,
		Err(RegistryError::SignalNotFound(id)) => {
			info!(conn_id, room = %room, "join refused: signal {id} not found");
			let _ = write
				.send(Message::Close(Some(CloseFrame {
					code: CloseCode::Policy,
					reason: "unknown room".into(),
				})))
				.await;
			return Ok(());
		}
		Err(err) => return Err(err.into()),
	};

	let (tx, mut rx) = mpsc::channel::<ChatMessage>(settings.outbound_queue_capacity);
	handle
		.join(ClientHandle {
			user_id,
			username: username.clone(),
			sender: tx,
		})
		.await;

	info!(conn_id, room = %room, user = user_id.0, username = %username, "client joined");
	metrics::counter!("muster_connections_total").increment(1);

	let write_timeout = settings.write_timeout;
	let keepalive = settings.keepalive_interval;
	let writer = tokio::spawn(async move {
		let mut ping = tokio::time::interval(keepalive);
		ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		ping.tick().await; // first tick fires immediately

		loop {
			tokio::select! {
				message = rx.recv() => {
					let Some(message) = message else {
						// Room evicted us or shut down.
						let _ = write.send(Message::Close(None)).await;
						break;
					};

					let body = match serde_json::to_string(&message) {
						Ok(body) => body,
						Err(err) => {
							warn!(error = %err, "outbound frame encode failed");
							continue;
						}
					};

					match tokio::time::timeout(write_timeout, write.send(Message::text(body))).await {
						Ok(Ok(())) => {}
						Ok(Err(err)) => {
							debug!(error = %err, "write pump: send failed");
							break;
						}
						Err(_) => {
							debug!("write pump: deadline exceeded");
							break;
						}
					}
				}
				_ = ping.tick() => {
					if write.send(Message::Ping(Vec::new().into())).await.is_err() {
						break;
					}
				}
			}
		}
	});

	// Read pump. Malformed or invalid frames are dropped, never fatal.
	// Any inbound frame, pongs included, pushes the liveness deadline out.
	let mut read_deadline = tokio::time::Instant::now() + settings.read_timeout;
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tokio::time::sleep_until(read_deadline) => {
				debug!(conn_id, "read pump: peer idle past deadline");
				break;
			}
			message = read.next() => {
				let message = match message {
					Some(Ok(message)) => message,
					Some(Err(err)) => {
						debug!(conn_id, error = %err, "read pump: socket error");
						break;
					}
					None => break,
				};
				read_deadline = tokio::time::Instant::now() + settings.read_timeout;

				match message {
					Message::Text(text) => {
						if text.len() > settings.max_frame_bytes {
							debug!(conn_id, len = text.len(), "oversized frame dropped");
							continue;
						}

						let frame: InboundFrame = match serde_json::from_str(text.as_str()) {
							Ok(frame) => frame,
							Err(err) => {
								debug!(conn_id, error = %err, "malformed frame dropped");
								continue;
							}
						};

						if let Err(err) = frame.validate() {
							debug!(conn_id, error = %err, "invalid frame dropped");
							continue;
						}

						handle
							.post(ChatMessage {
								id: 0,
								room_id: room,
								user_id,
								username: username.clone(),
								content: frame.content,
								kind: frame.kind,
								timestamp: unix_ms_now(),
							})
							.await;
					}
					Message::Close(_) => break,
					// Pongs and pings are handled by the protocol layer.
					_ => {}
				}
			}
		}
	}

	handle.leave(user_id).await;
	info!(conn_id, room = %room, user = user_id.0, "client left");

	// Give the writer a moment to flush the close frame.
	let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

	Ok(())
}
