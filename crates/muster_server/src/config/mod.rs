#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.muster/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".muster").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub queue: QueueSettings,
	pub chat: ChatSettings,
	pub scheduler: SchedulerSettings,
	pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Websocket listener bind address (host:port).
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable persistence.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
	/// Redis URL backing the job queue. Unset means an in-process queue.
	pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
	/// How long a room outlives its signal's scheduled time.
	pub room_grace: Duration,
	pub room_queue_capacity: usize,
	pub client_queue_capacity: usize,
	pub keepalive_interval: Duration,
	pub write_timeout: Duration,
	pub read_timeout: Duration,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			room_grace: Duration::from_secs(24 * 3600),
			room_queue_capacity: 256,
			client_queue_capacity: 256,
			keepalive_interval: Duration::from_secs(54),
			write_timeout: Duration::from_secs(10),
			read_timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
	pub expired_signals_interval: Duration,
	pub rooms_interval: Duration,
	pub manner_scores_interval: Duration,
	pub promote_interval: Duration,
}

impl Default for SchedulerSettings {
	fn default() -> Self {
		Self {
			expired_signals_interval: Duration::from_secs(60),
			rooms_interval: Duration::from_secs(300),
			manner_scores_interval: Duration::from_secs(3600),
			promote_interval: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
	pub pop_timeout: Duration,
	pub push_backoff: Duration,
	pub email_backoff: Duration,
	pub room_backoff: Duration,
}

impl Default for WorkerSettings {
	fn default() -> Self {
		Self {
			pop_timeout: Duration::from_secs(5),
			push_backoff: Duration::from_secs(30),
			email_backoff: Duration::from_secs(60),
			room_backoff: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	queue: FileQueueSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	scheduler: FileSchedulerSettings,

	#[serde(default)]
	worker: FileWorkerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileQueueSettings {
	redis_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	room_grace_hours: Option<u64>,
	room_queue_capacity: Option<usize>,
	client_queue_capacity: Option<usize>,
	keepalive_secs: Option<u64>,
	write_timeout_secs: Option<u64>,
	read_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSchedulerSettings {
	expired_signals_interval_secs: Option<u64>,
	rooms_interval_secs: Option<u64>,
	manner_scores_interval_secs: Option<u64>,
	promote_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWorkerSettings {
	pop_timeout_secs: Option<u64>,
	push_backoff_secs: Option<u64>,
	email_backoff_secs: Option<u64>,
	room_backoff_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let chat_defaults = ChatSettings::default();
		let chat = ChatSettings {
			room_grace: file
				.chat
				.room_grace_hours
				.map(|h| Duration::from_secs(h * 3600))
				.unwrap_or(chat_defaults.room_grace),
			room_queue_capacity: file.chat.room_queue_capacity.unwrap_or(chat_defaults.room_queue_capacity),
			client_queue_capacity: file.chat.client_queue_capacity.unwrap_or(chat_defaults.client_queue_capacity),
			keepalive_interval: file
				.chat
				.keepalive_secs
				.map(Duration::from_secs)
				.unwrap_or(chat_defaults.keepalive_interval),
			write_timeout: file
				.chat
				.write_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(chat_defaults.write_timeout),
			read_timeout: file
				.chat
				.read_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(chat_defaults.read_timeout),
		};

		let scheduler_defaults = SchedulerSettings::default();
		let scheduler = SchedulerSettings {
			expired_signals_interval: file
				.scheduler
				.expired_signals_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(scheduler_defaults.expired_signals_interval),
			rooms_interval: file
				.scheduler
				.rooms_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(scheduler_defaults.rooms_interval),
			manner_scores_interval: file
				.scheduler
				.manner_scores_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(scheduler_defaults.manner_scores_interval),
			promote_interval: file
				.scheduler
				.promote_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(scheduler_defaults.promote_interval),
		};

		let worker_defaults = WorkerSettings::default();
		let worker = WorkerSettings {
			pop_timeout: file
				.worker
				.pop_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(worker_defaults.pop_timeout),
			push_backoff: file
				.worker
				.push_backoff_secs
				.map(Duration::from_secs)
				.unwrap_or(worker_defaults.push_backoff),
			email_backoff: file
				.worker
				.email_backoff_secs
				.map(Duration::from_secs)
				.unwrap_or(worker_defaults.email_backoff),
			room_backoff: file
				.worker
				.room_backoff_secs
				.map(Duration::from_secs)
				.unwrap_or(worker_defaults.room_backoff),
		};

		Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			queue: QueueSettings {
				redis_url: file.queue.redis_url.filter(|s| !s.trim().is_empty()),
			},
			chat,
			scheduler,
			worker,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("MUSTER_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = Some(v);
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MUSTER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MUSTER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MUSTER_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("MUSTER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MUSTER_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.queue.redis_url = Some(v);
			info!("queue: redis_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MUSTER_ROOM_GRACE_HOURS")
		&& let Ok(hours) = v.trim().parse::<u64>()
	{
		cfg.chat.room_grace = Duration::from_secs(hours * 3600);
		info!(hours, "chat config: room_grace overridden by env");
	}

	if let Ok(v) = std::env::var("MUSTER_CLIENT_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.chat.client_queue_capacity = capacity;
		info!(capacity, "chat config: client_queue_capacity overridden by env");
	}
}
