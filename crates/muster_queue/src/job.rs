#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use muster_domain::{SignalId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default retry ceiling applied on enqueue when none is set.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Known job types. The string tags are the ready-list key suffixes and
/// must stay stable across deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
	SendPushNotification,
	ExpireSignal,
	ExpireChatRoom,
	SendEmail,
	UpdateMannerScore,
}

impl JobType {
	pub const ALL: [JobType; 5] = [
		JobType::SendPushNotification,
		JobType::ExpireSignal,
		JobType::ExpireChatRoom,
		JobType::SendEmail,
		JobType::UpdateMannerScore,
	];

	pub const fn as_str(self) -> &'static str {
		match self {
			JobType::SendPushNotification => "send_push_notification",
			JobType::ExpireSignal => "expire_signal",
			JobType::ExpireChatRoom => "expire_chat_room",
			JobType::SendEmail => "send_email",
			JobType::UpdateMannerScore => "update_manner_score",
		}
	}
}

impl fmt::Display for JobType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Error for parsing a job type tag.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown job type: {0}")]
pub struct UnknownJobType(String);

impl FromStr for JobType {
	type Err = UnknownJobType;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"send_push_notification" => Ok(JobType::SendPushNotification),
			"expire_signal" => Ok(JobType::ExpireSignal),
			"expire_chat_room" => Ok(JobType::ExpireChatRoom),
			"send_email" => Ok(JobType::SendEmail),
			"update_manner_score" => Ok(JobType::UpdateMannerScore),
			other => Err(UnknownJobType(other.to_string())),
		}
	}
}

/// Payload of a push notification delivery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotificationPayload {
	pub user_ids: Vec<UserId>,
	pub title: String,
	pub body: String,
	#[serde(default)]
	pub data: BTreeMap<String, String>,
}

/// Payload of a signal expiry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireSignalPayload {
	pub signal_id: SignalId,
}

/// Payload of a chat room teardown job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireChatRoomPayload {
	pub chat_room_id: i64,
}

/// Payload of an email delivery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
	pub to: String,
	pub subject: String,
	pub template: String,
	#[serde(default)]
	pub data: BTreeMap<String, String>,
}

/// Payload of a manner score recomputation job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMannerScorePayload {}

/// One concrete payload type per job type, so a handler never has to
/// fish fields out of an untyped map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
	SendPushNotification(PushNotificationPayload),
	ExpireSignal(ExpireSignalPayload),
	ExpireChatRoom(ExpireChatRoomPayload),
	SendEmail(EmailPayload),
	UpdateMannerScore(UpdateMannerScorePayload),
}

impl JobPayload {
	pub const fn job_type(&self) -> JobType {
		match self {
			JobPayload::SendPushNotification(_) => JobType::SendPushNotification,
			JobPayload::ExpireSignal(_) => JobType::ExpireSignal,
			JobPayload::ExpireChatRoom(_) => JobType::ExpireChatRoom,
			JobPayload::SendEmail(_) => JobType::SendEmail,
			JobPayload::UpdateMannerScore(_) => JobType::UpdateMannerScore,
		}
	}
}

/// A unit of deferred or asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
	pub id: String,
	#[serde(flatten)]
	pub payload: JobPayload,
	/// Unix milliseconds.
	pub created_at: i64,
	pub attempts: u32,
	pub max_retries: u32,
}

impl Job {
	/// Build a job with a fresh id and default retry ceiling.
	pub fn new(payload: JobPayload) -> Self {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
		let id = format!("{}-{}", now.as_nanos(), payload.job_type());

		Self {
			id,
			payload,
			created_at: now.as_millis() as i64,
			attempts: 0,
			max_retries: DEFAULT_MAX_RETRIES,
		}
	}

	pub fn job_type(&self) -> JobType {
		self.payload.job_type()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn job_type_tags_are_stable() {
		for ty in JobType::ALL {
			assert_eq!(ty.as_str().parse::<JobType>().unwrap(), ty);
		}
		assert!("cleanup_data_v2".parse::<JobType>().is_err());
	}

	#[test]
	fn new_job_defaults() {
		let job = Job::new(JobPayload::ExpireSignal(ExpireSignalPayload {
			signal_id: SignalId(9),
		}));

		assert!(job.id.ends_with("-expire_signal"));
		assert_eq!(job.attempts, 0);
		assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
		assert_eq!(job.job_type(), JobType::ExpireSignal);
	}

	#[test]
	fn job_wire_shape_keeps_type_and_payload_fields() {
		let job = Job::new(JobPayload::SendEmail(EmailPayload {
			to: "a@b.c".to_string(),
			subject: "hi".to_string(),
			template: "welcome".to_string(),
			data: BTreeMap::new(),
		}));

		let json = serde_json::to_value(&job).unwrap();
		assert_eq!(json["type"], "send_email");
		assert_eq!(json["payload"]["to"], "a@b.c");

		let back: Job = serde_json::from_value(json).unwrap();
		assert_eq!(back, job);
	}

	#[test]
	fn push_payload_roundtrip_with_user_ids() {
		let payload = JobPayload::SendPushNotification(PushNotificationPayload {
			user_ids: vec![UserId(1), UserId(2)],
			title: "room open".to_string(),
			body: "your meetup chat room is open".to_string(),
			data: BTreeMap::from([("room".to_string(), "signal_4".to_string())]),
		});

		let job = Job::new(payload.clone());
		let encoded = serde_json::to_string(&job).unwrap();
		let decoded: Job = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded.payload, payload);
	}
}
