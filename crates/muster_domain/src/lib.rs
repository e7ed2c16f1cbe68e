#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum chat message content length, in characters.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Errors for parsing identifiers and frames from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown message type: {0}")]
	UnknownMessageType(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Identifier of a signal (one meetup event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub u64);

impl fmt::Display for SignalId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SignalId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(SignalId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected numeric signal id, got {s:?}")))
	}
}

/// Identifier of a user. `0` is reserved on the wire for system-generated messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
	/// Wire value used for system-generated messages.
	pub const SYSTEM: UserId = UserId(0);

	pub fn is_system(self) -> bool {
		self.0 == 0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Key of a chat room, derived from its owning signal: `signal_<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey {
	pub signal: SignalId,
}

impl RoomKey {
	/// Prefix for room keys.
	pub const PREFIX: &'static str = "signal_";

	pub fn for_signal(signal: SignalId) -> Self {
		Self { signal }
	}

	/// Parse a `signal_<id>` room key.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected signal_<id>".into()))?;

		let signal = rest.parse::<SignalId>()?;
		Ok(Self { signal })
	}
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}", Self::PREFIX, self.signal)
	}
}

impl FromStr for RoomKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomKey::parse(s)
	}
}

impl TryFrom<String> for RoomKey {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		RoomKey::parse(&s)
	}
}

impl From<RoomKey> for String {
	fn from(key: RoomKey) -> Self {
		key.to_string()
	}
}

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
	Text,
	Image,
	System,
}

impl MessageType {
	/// Stable string identifier, matching the wire and database encoding.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::Text => "text",
			MessageType::Image => "image",
			MessageType::System => "system",
		}
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s {
			"text" => Ok(MessageType::Text),
			"image" => Ok(MessageType::Image),
			"system" => Ok(MessageType::System),
			other => Err(ParseIdError::UnknownMessageType(other.to_string())),
		}
	}
}

/// Outbound chat frame, broadcast to every participant and persisted.
///
/// `id` is `0` until the persistence layer assigns one; delivery never waits
/// for the write. `user_id == 0` denotes a system-generated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	#[serde(default)]
	pub id: i64,
	pub room_id: RoomKey,
	pub user_id: UserId,
	pub username: String,
	pub content: String,
	#[serde(rename = "type")]
	pub kind: MessageType,
	/// Unix milliseconds.
	pub timestamp: i64,
}

impl ChatMessage {
	/// Build a system-generated message for `room`.
	pub fn system(room: RoomKey, content: impl Into<String>, timestamp: i64) -> Self {
		Self {
			id: 0,
			room_id: room,
			user_id: UserId::SYSTEM,
			username: "system".to_string(),
			content: content.into(),
			kind: MessageType::System,
			timestamp,
		}
	}

	pub fn author(&self) -> Option<UserId> {
		if self.user_id.is_system() { None } else { Some(self.user_id) }
	}
}

/// Inbound client frame: `{"type": "text"|"image", "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
	#[serde(rename = "type")]
	pub kind: MessageType,
	pub content: String,
}

/// Reasons an inbound frame is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
	#[error("empty content")]
	EmptyContent,
	#[error("content too long: {0} chars")]
	ContentTooLong(usize),
	#[error("clients may not send system messages")]
	SystemType,
}

impl InboundFrame {
	/// Minimal shape validation; a failing frame is dropped, never fatal.
	pub fn validate(&self) -> Result<(), FrameError> {
		if self.content.trim().is_empty() {
			return Err(FrameError::EmptyContent);
		}

		let chars = self.content.chars().count();
		if chars > MAX_CONTENT_CHARS {
			return Err(FrameError::ContentTooLong(chars));
		}

		if self.kind == MessageType::System {
			return Err(FrameError::SystemType);
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn room_key_parse_roundtrip() {
		let key = RoomKey::parse("signal_42").unwrap();
		assert_eq!(key.signal, SignalId(42));
		assert_eq!(key.to_string(), "signal_42");
	}

	#[test]
	fn room_key_rejects_garbage() {
		assert_eq!(RoomKey::parse(""), Err(ParseIdError::Empty));
		assert!(RoomKey::parse("room_42").is_err());
		assert!(RoomKey::parse("signal_").is_err());
		assert!(RoomKey::parse("signal_abc").is_err());
	}

	#[test]
	fn message_type_parse_and_display() {
		assert_eq!("text".parse::<MessageType>().unwrap(), MessageType::Text);
		assert_eq!(MessageType::System.to_string(), "system");
		assert!("location".parse::<MessageType>().is_err());
	}

	#[test]
	fn system_message_has_null_author() {
		let msg = ChatMessage::system(RoomKey::for_signal(SignalId(1)), "joined", 1);
		assert!(msg.user_id.is_system());
		assert_eq!(msg.author(), None);
		assert_eq!(msg.kind, MessageType::System);
	}

	#[test]
	fn inbound_frame_validation() {
		let ok = InboundFrame {
			kind: MessageType::Text,
			content: "hello".to_string(),
		};
		assert!(ok.validate().is_ok());

		let empty = InboundFrame {
			kind: MessageType::Text,
			content: "   ".to_string(),
		};
		assert_eq!(empty.validate(), Err(FrameError::EmptyContent));

		let long = InboundFrame {
			kind: MessageType::Text,
			content: "x".repeat(MAX_CONTENT_CHARS + 1),
		};
		assert!(matches!(long.validate(), Err(FrameError::ContentTooLong(_))));

		let system = InboundFrame {
			kind: MessageType::System,
			content: "nope".to_string(),
		};
		assert_eq!(system.validate(), Err(FrameError::SystemType));
	}

	#[test]
	fn inbound_frame_rejects_unknown_type_at_decode() {
		let err = serde_json::from_str::<InboundFrame>(r#"{"type":"location","content":"x"}"#);
		assert!(err.is_err());
	}

	#[test]
	fn chat_message_wire_shape() {
		let msg = ChatMessage {
			id: 7,
			room_id: RoomKey::for_signal(SignalId(3)),
			user_id: UserId(11),
			username: "mina".to_string(),
			content: "hi".to_string(),
			kind: MessageType::Text,
			timestamp: 1_700_000_000_000,
		};
		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(json["room_id"], "signal_3");
		assert_eq!(json["type"], "text");
		assert_eq!(json["user_id"], 11);
	}

	proptest! {
		#[test]
		fn room_key_roundtrips_for_any_id(id in any::<u64>()) {
			let key = RoomKey::for_signal(SignalId(id));
			let parsed = RoomKey::parse(&key.to_string()).unwrap();
			prop_assert_eq!(parsed, key);
		}
	}
}
