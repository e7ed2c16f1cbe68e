#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use muster_domain::{MessageType, RoomKey, SignalId, UserId};

use crate::util::time::unix_ms_now;

/// Lifecycle status of a signal (meetup event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
	Active,
	Full,
	Closed,
}

impl SignalStatus {
	fn parse(s: &str) -> anyhow::Result<Self> {
		match s {
			"active" => Ok(SignalStatus::Active),
			"full" => Ok(SignalStatus::Full),
			"closed" => Ok(SignalStatus::Closed),
			other => Err(anyhow!("unknown signal status: {other}")),
		}
	}
}

/// Lifecycle status of a chat room row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
	Active,
	Expired,
}

impl RoomStatus {
	fn parse(s: &str) -> anyhow::Result<Self> {
		match s {
			"active" => Ok(RoomStatus::Active),
			"expired" => Ok(RoomStatus::Expired),
			other => Err(anyhow!("unknown room status: {other}")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRecord {
	pub id: SignalId,
	pub title: String,
	pub status: SignalStatus,
	pub creator_id: UserId,
	/// Scheduled meeting time, Unix milliseconds.
	pub scheduled_at_ms: i64,
	/// When the signal stops accepting participants.
	pub expires_at_ms: i64,
	pub current_participants: i64,
	pub max_participants: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatRoomRecord {
	pub id: i64,
	pub signal_id: SignalId,
	pub status: RoomStatus,
	pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: i64,
	pub author: Option<UserId>,
	pub kind: MessageType,
	pub content: String,
	pub created_at_ms: i64,
}

/// Persistence boundary for rooms, messages, and scheduler scans.
///
/// Every call is fallible and retryable; the room actor logs and continues
/// on failure rather than blocking broadcast.
#[async_trait]
pub trait Store: Send + Sync {
	/// Append a message; `author: None` persists a system message. Returns
	/// the assigned message id.
	async fn create_message(
		&self,
		room: RoomKey,
		author: Option<UserId>,
		kind: MessageType,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<i64>;

	async fn list_messages(&self, room: RoomKey, limit: i64) -> anyhow::Result<Vec<StoredMessage>>;

	async fn find_signal(&self, id: SignalId) -> anyhow::Result<Option<SignalRecord>>;

	async fn find_room_by_signal(&self, id: SignalId) -> anyhow::Result<Option<ChatRoomRecord>>;

	async fn find_room(&self, room_id: i64) -> anyhow::Result<Option<ChatRoomRecord>>;

	/// Whether `user` may join the room of `signal`: its creator, or an
	/// approved participant.
	async fn can_join(&self, signal: SignalId, user: UserId) -> anyhow::Result<bool>;

	async fn approved_participants(&self, signal: SignalId) -> anyhow::Result<Vec<UserId>>;

	async fn list_expired_signals(&self, now_ms: i64) -> anyhow::Result<Vec<SignalRecord>>;

	/// Idempotent: closing an already-closed signal is a no-op.
	async fn close_signal(&self, id: SignalId) -> anyhow::Result<()>;

	async fn list_full_unroomed_signals(&self) -> anyhow::Result<Vec<SignalRecord>>;

	async fn create_chat_room(&self, signal: SignalId, name: &str, expires_at_ms: i64) -> anyhow::Result<i64>;

	async fn list_expired_rooms(&self, now_ms: i64) -> anyhow::Result<Vec<ChatRoomRecord>>;

	/// Mark a room expired and soft-delete its messages. Returns `false`
	/// when the room is already expired or unknown (idempotent teardown).
	async fn expire_chat_room(&self, room_id: i64) -> anyhow::Result<bool>;

	/// Recompute manner scores from ratings inside the window: mean score
	/// minus 0.5 per no-show, floored at 1.0. Returns updated profiles.
	async fn recompute_manner_scores(&self, window_ms: i64) -> anyhow::Result<u64>;
}

/// SQL-backed store (sqlite or postgres, selected by URL scheme).
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type SignalRow = (i64, String, String, i64, i64, i64, i64, i64);
type RoomRow = (i64, i64, String, i64);

fn signal_from_row(row: SignalRow) -> anyhow::Result<SignalRecord> {
	let (id, title, status, creator_id, scheduled_at_ms, expires_at_ms, current_participants, max_participants) = row;
	Ok(SignalRecord {
		id: SignalId(id as u64),
		title,
		status: SignalStatus::parse(&status)?,
		creator_id: UserId(creator_id as u64),
		scheduled_at_ms,
		expires_at_ms,
		current_participants,
		max_participants,
	})
}

fn room_from_row(row: RoomRow) -> anyhow::Result<ChatRoomRecord> {
	let (id, signal_id, status, expires_at_ms) = row;
	Ok(ChatRoomRecord {
		id,
		signal_id: SignalId(signal_id as u64),
		status: RoomStatus::parse(&status)?,
		expires_at_ms,
	})
}

const SIGNAL_COLUMNS: &str =
	"id, title, status, creator_id, scheduled_at_ms, expires_at_ms, current_participants, max_participants";
const ROOM_COLUMNS: &str = "id, signal_id, status, expires_at_ms";

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// An in-memory sqlite database exists per connection, so the
			// pool must not open a second one.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	async fn room_id_for_signal(&self, signal: SignalId) -> anyhow::Result<Option<i64>> {
		Ok(self.find_room_by_signal(signal).await?.map(|room| room.id))
	}
}

#[async_trait]
impl Store for SqlStore {
	async fn create_message(
		&self,
		room: RoomKey,
		author: Option<UserId>,
		kind: MessageType,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<i64> {
		let room_id = self
			.room_id_for_signal(room.signal)
			.await?
			.ok_or_else(|| anyhow!("no chat room row for {room}"))?;
		let author = author.map(|u| u.0 as i64);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let res = sqlx::query(
					"INSERT INTO chat_messages (chat_room_id, user_id, type, content, created_at_ms) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(room_id)
				.bind(author)
				.bind(kind.as_str())
				.bind(content)
				.bind(created_at_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;

				Ok(res.last_insert_rowid())
			}
			SqlBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO chat_messages (chat_room_id, user_id, type, content, created_at_ms) VALUES ($1, $2, $3, $4, $5) RETURNING id",
				)
				.bind(room_id)
				.bind(author)
				.bind(kind.as_str())
				.bind(content)
				.bind(created_at_ms)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;

				Ok(id)
			}
		}
	}

	async fn list_messages(&self, room: RoomKey, limit: i64) -> anyhow::Result<Vec<StoredMessage>> {
		let Some(room_id) = self.room_id_for_signal(room.signal).await? else {
			return Ok(Vec::new());
		};

		let rows: Vec<(i64, Option<i64>, String, String, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, user_id, type, content, created_at_ms FROM chat_messages \
				WHERE chat_room_id = ? AND deleted_at_ms IS NULL ORDER BY created_at_ms ASC, id ASC LIMIT ?",
			)
			.bind(room_id)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("list messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, user_id, type, content, created_at_ms FROM chat_messages \
				WHERE chat_room_id = $1 AND deleted_at_ms IS NULL ORDER BY created_at_ms ASC, id ASC LIMIT $2",
			)
			.bind(room_id)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("list messages (postgres)")?,
		};

		let mut messages = Vec::with_capacity(rows.len());
		for (id, user_id, kind, content, created_at_ms) in rows {
			messages.push(StoredMessage {
				id,
				author: user_id.map(|u| UserId(u as u64)),
				kind: kind.parse().map_err(|e| anyhow!("stored message type: {e}"))?,
				content,
				created_at_ms,
			});
		}
		Ok(messages)
	}

	async fn find_signal(&self, id: SignalId) -> anyhow::Result<Option<SignalRecord>> {
		let row: Option<SignalRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?"))
					.bind(id.0 as i64)
					.fetch_optional(pool)
					.await
					.context("find signal (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = $1"))
					.bind(id.0 as i64)
					.fetch_optional(pool)
					.await
					.context("find signal (postgres)")?
			}
		};

		row.map(signal_from_row).transpose()
	}

	async fn find_room_by_signal(&self, id: SignalId) -> anyhow::Result<Option<ChatRoomRecord>> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE signal_id = ? AND deleted_at_ms IS NULL"
			))
			.bind(id.0 as i64)
			.fetch_optional(pool)
			.await
			.context("find room by signal (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE signal_id = $1 AND deleted_at_ms IS NULL"
			))
			.bind(id.0 as i64)
			.fetch_optional(pool)
			.await
			.context("find room by signal (postgres)")?,
		};

		row.map(room_from_row).transpose()
	}

	async fn find_room(&self, room_id: i64) -> anyhow::Result<Option<ChatRoomRecord>> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE id = ?"))
					.bind(room_id)
					.fetch_optional(pool)
					.await
					.context("find room (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE id = $1"))
					.bind(room_id)
					.fetch_optional(pool)
					.await
					.context("find room (postgres)")?
			}
		};

		row.map(room_from_row).transpose()
	}

	async fn can_join(&self, signal: SignalId, user: UserId) -> anyhow::Result<bool> {
		let Some(record) = self.find_signal(signal).await? else {
			return Ok(false);
		};
		if record.creator_id == user {
			return Ok(true);
		}

		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT 1 FROM signal_participants WHERE signal_id = ? AND user_id = ? AND status = 'approved'",
			)
			.bind(signal.0 as i64)
			.bind(user.0 as i64)
			.fetch_optional(pool)
			.await
			.context("participant lookup (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT 1 FROM signal_participants WHERE signal_id = $1 AND user_id = $2 AND status = 'approved'",
			)
			.bind(signal.0 as i64)
			.bind(user.0 as i64)
			.fetch_optional(pool)
			.await
			.context("participant lookup (postgres)")?,
		};

		Ok(row.is_some())
	}

	async fn approved_participants(&self, signal: SignalId) -> anyhow::Result<Vec<UserId>> {
		let rows: Vec<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM signal_participants WHERE signal_id = ? AND status = 'approved'")
					.bind(signal.0 as i64)
					.fetch_all(pool)
					.await
					.context("approved participants (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM signal_participants WHERE signal_id = $1 AND status = 'approved'")
					.bind(signal.0 as i64)
					.fetch_all(pool)
					.await
					.context("approved participants (postgres)")?
			}
		};

		Ok(rows.into_iter().map(|(u,)| UserId(u as u64)).collect())
	}

	async fn list_expired_signals(&self, now_ms: i64) -> anyhow::Result<Vec<SignalRecord>> {
		let rows: Vec<SignalRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {SIGNAL_COLUMNS} FROM signals WHERE status = 'active' AND expires_at_ms < ?"
			))
			.bind(now_ms)
			.fetch_all(pool)
			.await
			.context("list expired signals (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {SIGNAL_COLUMNS} FROM signals WHERE status = 'active' AND expires_at_ms < $1"
			))
			.bind(now_ms)
			.fetch_all(pool)
			.await
			.context("list expired signals (postgres)")?,
		};

		rows.into_iter().map(signal_from_row).collect()
	}

	async fn close_signal(&self, id: SignalId) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE signals SET status = 'closed' WHERE id = ? AND status != 'closed'")
					.bind(id.0 as i64)
					.execute(pool)
					.await
					.context("close signal (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE signals SET status = 'closed' WHERE id = $1 AND status != 'closed'")
					.bind(id.0 as i64)
					.execute(pool)
					.await
					.context("close signal (postgres)")?;
			}
		}
		Ok(())
	}

	async fn list_full_unroomed_signals(&self) -> anyhow::Result<Vec<SignalRecord>> {
		let query = format!(
			"SELECT {SIGNAL_COLUMNS} FROM signals \
			WHERE status = 'full' AND current_participants >= max_participants \
			AND id NOT IN (SELECT signal_id FROM chat_rooms WHERE deleted_at_ms IS NULL)"
		);

		let rows: Vec<SignalRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&query)
				.fetch_all(pool)
				.await
				.context("list full unroomed signals (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&query)
				.fetch_all(pool)
				.await
				.context("list full unroomed signals (postgres)")?,
		};

		rows.into_iter().map(signal_from_row).collect()
	}

	async fn create_chat_room(&self, signal: SignalId, name: &str, expires_at_ms: i64) -> anyhow::Result<i64> {
		let now_ms = unix_ms_now();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let res = sqlx::query(
					"INSERT INTO chat_rooms (signal_id, name, status, expires_at_ms, created_at_ms) VALUES (?, ?, 'active', ?, ?)",
				)
				.bind(signal.0 as i64)
				.bind(name)
				.bind(expires_at_ms)
				.bind(now_ms)
				.execute(pool)
				.await
				.context("create chat room (sqlite)")?;

				Ok(res.last_insert_rowid())
			}
			SqlBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO chat_rooms (signal_id, name, status, expires_at_ms, created_at_ms) VALUES ($1, $2, 'active', $3, $4) RETURNING id",
				)
				.bind(signal.0 as i64)
				.bind(name)
				.bind(expires_at_ms)
				.bind(now_ms)
				.fetch_one(pool)
				.await
				.context("create chat room (postgres)")?;

				Ok(id)
			}
		}
	}

	async fn list_expired_rooms(&self, now_ms: i64) -> anyhow::Result<Vec<ChatRoomRecord>> {
		let rows: Vec<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE status = 'active' AND deleted_at_ms IS NULL AND expires_at_ms < ?"
			))
			.bind(now_ms)
			.fetch_all(pool)
			.await
			.context("list expired rooms (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE status = 'active' AND deleted_at_ms IS NULL AND expires_at_ms < $1"
			))
			.bind(now_ms)
			.fetch_all(pool)
			.await
			.context("list expired rooms (postgres)")?,
		};

		rows.into_iter().map(room_from_row).collect()
	}

	async fn expire_chat_room(&self, room_id: i64) -> anyhow::Result<bool> {
		let now_ms = unix_ms_now();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin tx (sqlite)")?;

				let res = sqlx::query(
					"UPDATE chat_rooms SET status = 'expired', deleted_at_ms = ? WHERE id = ? AND status = 'active'",
				)
				.bind(now_ms)
				.bind(room_id)
				.execute(&mut *tx)
				.await
				.context("expire room (sqlite)")?;

				if res.rows_affected() == 0 {
					tx.rollback().await.context("rollback (sqlite)")?;
					return Ok(false);
				}

				sqlx::query("UPDATE chat_messages SET deleted_at_ms = ? WHERE chat_room_id = ? AND deleted_at_ms IS NULL")
					.bind(now_ms)
					.bind(room_id)
					.execute(&mut *tx)
					.await
					.context("soft-delete messages (sqlite)")?;

				tx.commit().await.context("commit (sqlite)")?;
				Ok(true)
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin tx (postgres)")?;

				let res = sqlx::query(
					"UPDATE chat_rooms SET status = 'expired', deleted_at_ms = $1 WHERE id = $2 AND status = 'active'",
				)
				.bind(now_ms)
				.bind(room_id)
				.execute(&mut *tx)
				.await
				.context("expire room (postgres)")?;

				if res.rows_affected() == 0 {
					tx.rollback().await.context("rollback (postgres)")?;
					return Ok(false);
				}

				sqlx::query("UPDATE chat_messages SET deleted_at_ms = $1 WHERE chat_room_id = $2 AND deleted_at_ms IS NULL")
					.bind(now_ms)
					.bind(room_id)
					.execute(&mut *tx)
					.await
					.context("soft-delete messages (postgres)")?;

				tx.commit().await.context("commit (postgres)")?;
				Ok(true)
			}
		}
	}

	async fn recompute_manner_scores(&self, window_ms: i64) -> anyhow::Result<u64> {
		let since_ms = unix_ms_now() - window_ms;

		let rows: Vec<(i64, f64, i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT ratee_id, AVG(score), COUNT(*), COALESCE(SUM(is_no_show), 0) \
				FROM user_ratings WHERE created_at_ms > ? GROUP BY ratee_id",
			)
			.bind(since_ms)
			.fetch_all(pool)
			.await
			.context("aggregate ratings (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT ratee_id, AVG(score)::DOUBLE PRECISION, COUNT(*), \
				COALESCE(SUM(CASE WHEN is_no_show THEN 1 ELSE 0 END), 0) \
				FROM user_ratings WHERE created_at_ms > $1 GROUP BY ratee_id",
			)
			.bind(since_ms)
			.fetch_all(pool)
			.await
			.context("aggregate ratings (postgres)")?,
		};

		let mut updated = 0u64;
		for (user_id, mean, total, no_shows) in rows {
			let score = manner_score(mean, no_shows);

			match &self.backend {
				SqlBackend::Sqlite(pool) => {
					sqlx::query(
						"INSERT INTO user_profiles (user_id, manner_score, total_ratings, no_show_count) VALUES (?, ?, ?, ?) \
						ON CONFLICT(user_id) DO UPDATE SET manner_score = excluded.manner_score, \
						total_ratings = excluded.total_ratings, no_show_count = excluded.no_show_count",
					)
					.bind(user_id)
					.bind(score)
					.bind(total)
					.bind(no_shows)
					.execute(pool)
					.await
					.context("upsert profile (sqlite)")?;
				}
				SqlBackend::Postgres(pool) => {
					sqlx::query(
						"INSERT INTO user_profiles (user_id, manner_score, total_ratings, no_show_count) VALUES ($1, $2, $3, $4) \
						ON CONFLICT (user_id) DO UPDATE SET manner_score = EXCLUDED.manner_score, \
						total_ratings = EXCLUDED.total_ratings, no_show_count = EXCLUDED.no_show_count",
					)
					.bind(user_id)
					.bind(score)
					.bind(total)
					.bind(no_shows)
					.execute(pool)
					.await
					.context("upsert profile (postgres)")?;
				}
			}

			updated += 1;
		}

		Ok(updated)
	}
}

/// Mean rating with a 0.5 penalty per no-show, floored at 1.0.
fn manner_score(mean: f64, no_shows: i64) -> f64 {
	let penalized = mean - 0.5 * no_shows as f64;
	penalized.max(1.0)
}

/// In-process store used by tests and deployments without persistence.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
	signals: HashMap<SignalId, SignalRecord>,
	approved: HashMap<SignalId, Vec<UserId>>,
	rooms: Vec<MemoryRoom>,
	messages: Vec<MemoryMessage>,
	ratings: Vec<MemoryRating>,
	profiles: HashMap<UserId, f64>,
	next_room_id: i64,
	next_message_id: i64,
}

struct MemoryRoom {
	record: ChatRoomRecord,
	deleted: bool,
}

struct MemoryMessage {
	stored: StoredMessage,
	room_id: i64,
	deleted: bool,
}

struct MemoryRating {
	ratee: UserId,
	score: i64,
	no_show: bool,
	created_at_ms: i64,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a signal fixture.
	#[allow(dead_code)]
	pub fn insert_signal(&self, record: SignalRecord) {
		let mut state = self.inner.lock().expect("memory store poisoned");
		state.signals.insert(record.id, record);
	}

	#[allow(dead_code)]
	pub fn approve_participant(&self, signal: SignalId, user: UserId) {
		let mut state = self.inner.lock().expect("memory store poisoned");
		state.approved.entry(signal).or_default().push(user);
	}

	#[allow(dead_code)]
	pub fn insert_rating(&self, ratee: UserId, score: i64, no_show: bool, created_at_ms: i64) {
		let mut state = self.inner.lock().expect("memory store poisoned");
		state.ratings.push(MemoryRating {
			ratee,
			score,
			no_show,
			created_at_ms,
		});
	}

	#[allow(dead_code)]
	pub fn manner_score_of(&self, user: UserId) -> Option<f64> {
		let state = self.inner.lock().expect("memory store poisoned");
		state.profiles.get(&user).copied()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn create_message(
		&self,
		room: RoomKey,
		author: Option<UserId>,
		kind: MessageType,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<i64> {
		let mut state = self.inner.lock().expect("memory store poisoned");

		let room_id = state
			.rooms
			.iter()
			.find(|r| r.record.signal_id == room.signal && !r.deleted)
			.map(|r| r.record.id)
			.ok_or_else(|| anyhow!("no chat room row for {room}"))?;

		state.next_message_id += 1;
		let id = state.next_message_id;
		state.messages.push(MemoryMessage {
			stored: StoredMessage {
				id,
				author,
				kind,
				content: content.to_string(),
				created_at_ms,
			},
			room_id,
			deleted: false,
		});

		Ok(id)
	}

	async fn list_messages(&self, room: RoomKey, limit: i64) -> anyhow::Result<Vec<StoredMessage>> {
		let state = self.inner.lock().expect("memory store poisoned");

		let Some(room_id) = state
			.rooms
			.iter()
			.find(|r| r.record.signal_id == room.signal && !r.deleted)
			.map(|r| r.record.id)
		else {
			return Ok(Vec::new());
		};

		Ok(state
			.messages
			.iter()
			.filter(|m| m.room_id == room_id && !m.deleted)
			.take(limit.max(0) as usize)
			.map(|m| m.stored.clone())
			.collect())
	}

	async fn find_signal(&self, id: SignalId) -> anyhow::Result<Option<SignalRecord>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state.signals.get(&id).cloned())
	}

	async fn find_room_by_signal(&self, id: SignalId) -> anyhow::Result<Option<ChatRoomRecord>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state
			.rooms
			.iter()
			.find(|r| r.record.signal_id == id && !r.deleted)
			.map(|r| r.record))
	}

	async fn find_room(&self, room_id: i64) -> anyhow::Result<Option<ChatRoomRecord>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state.rooms.iter().find(|r| r.record.id == room_id).map(|r| r.record))
	}

	async fn can_join(&self, signal: SignalId, user: UserId) -> anyhow::Result<bool> {
		let state = self.inner.lock().expect("memory store poisoned");
		let Some(record) = state.signals.get(&signal) else {
			return Ok(false);
		};
		if record.creator_id == user {
			return Ok(true);
		}
		Ok(state.approved.get(&signal).is_some_and(|users| users.contains(&user)))
	}

	async fn approved_participants(&self, signal: SignalId) -> anyhow::Result<Vec<UserId>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state.approved.get(&signal).cloned().unwrap_or_default())
	}

	async fn list_expired_signals(&self, now_ms: i64) -> anyhow::Result<Vec<SignalRecord>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state
			.signals
			.values()
			.filter(|s| s.status == SignalStatus::Active && s.expires_at_ms < now_ms)
			.cloned()
			.collect())
	}

	async fn close_signal(&self, id: SignalId) -> anyhow::Result<()> {
		let mut state = self.inner.lock().expect("memory store poisoned");
		if let Some(signal) = state.signals.get_mut(&id) {
			signal.status = SignalStatus::Closed;
		}
		Ok(())
	}

	async fn list_full_unroomed_signals(&self) -> anyhow::Result<Vec<SignalRecord>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state
			.signals
			.values()
			.filter(|s| {
				s.status == SignalStatus::Full
					&& s.current_participants >= s.max_participants
					&& !state.rooms.iter().any(|r| r.record.signal_id == s.id && !r.deleted)
			})
			.cloned()
			.collect())
	}

	async fn create_chat_room(&self, signal: SignalId, _name: &str, expires_at_ms: i64) -> anyhow::Result<i64> {
		let mut state = self.inner.lock().expect("memory store poisoned");
		state.next_room_id += 1;
		let id = state.next_room_id;
		state.rooms.push(MemoryRoom {
			record: ChatRoomRecord {
				id,
				signal_id: signal,
				status: RoomStatus::Active,
				expires_at_ms,
			},
			deleted: false,
		});
		Ok(id)
	}

	async fn list_expired_rooms(&self, now_ms: i64) -> anyhow::Result<Vec<ChatRoomRecord>> {
		let state = self.inner.lock().expect("memory store poisoned");
		Ok(state
			.rooms
			.iter()
			.filter(|r| r.record.status == RoomStatus::Active && !r.deleted && r.record.expires_at_ms < now_ms)
			.map(|r| r.record)
			.collect())
	}

	async fn expire_chat_room(&self, room_id: i64) -> anyhow::Result<bool> {
		let mut state = self.inner.lock().expect("memory store poisoned");

		let Some(idx) = state
			.rooms
			.iter()
			.position(|r| r.record.id == room_id && r.record.status == RoomStatus::Active)
		else {
			return Ok(false);
		};

		state.rooms[idx].record.status = RoomStatus::Expired;
		state.rooms[idx].deleted = true;
		for message in state.messages.iter_mut().filter(|m| m.room_id == room_id) {
			message.deleted = true;
		}
		Ok(true)
	}

	async fn recompute_manner_scores(&self, window_ms: i64) -> anyhow::Result<u64> {
		let since_ms = unix_ms_now() - window_ms;
		let mut state = self.inner.lock().expect("memory store poisoned");

		let mut aggregates: HashMap<UserId, (i64, i64, i64)> = HashMap::new();
		for rating in state.ratings.iter().filter(|r| r.created_at_ms > since_ms) {
			let entry = aggregates.entry(rating.ratee).or_default();
			entry.0 += rating.score;
			entry.1 += 1;
			entry.2 += i64::from(rating.no_show);
		}

		let updated = aggregates.len() as u64;
		for (user, (total, count, no_shows)) in aggregates {
			let score = manner_score(total as f64 / count as f64, no_shows);
			state.profiles.insert(user, score);
		}

		Ok(updated)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn signal(id: u64, status: SignalStatus) -> SignalRecord {
		SignalRecord {
			id: SignalId(id),
			title: format!("signal {id}"),
			status,
			creator_id: UserId(1),
			scheduled_at_ms: 1_000,
			expires_at_ms: 2_000,
			current_participants: 4,
			max_participants: 4,
		}
	}

	#[test]
	fn manner_score_applies_penalty_and_floor() {
		assert_eq!(manner_score(4.0, 0), 4.0);
		assert_eq!(manner_score(4.0, 2), 3.0);
		assert_eq!(manner_score(1.2, 5), 1.0);
	}

	#[tokio::test]
	async fn sqlite_message_lifecycle() {
		let store = SqlStore::connect("sqlite::memory:").await.unwrap();
		let room_id = store.create_chat_room(SignalId(7), "signal 7", 9_999).await.unwrap();
		let room = RoomKey::for_signal(SignalId(7));

		let msg_id = store
			.create_message(room, Some(UserId(3)), MessageType::Text, "hello", 100)
			.await
			.unwrap();
		assert!(msg_id > 0);
		store
			.create_message(room, None, MessageType::System, "joined", 101)
			.await
			.unwrap();

		let messages = store.list_messages(room, 10).await.unwrap();
		assert_eq!(messages.len(), 2);
		assert_eq!(messages[0].author, Some(UserId(3)));
		assert_eq!(messages[1].author, None);

		assert!(store.expire_chat_room(room_id).await.unwrap());
		// Second teardown of the same room is a no-op.
		assert!(!store.expire_chat_room(room_id).await.unwrap());
		assert!(store.list_messages(room, 10).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn sqlite_signal_scans_gate_on_status() {
		let store = SqlStore::connect("sqlite::memory:").await.unwrap();

		sqlx::query(
			"INSERT INTO signals (id, title, status, creator_id, scheduled_at_ms, expires_at_ms, current_participants, max_participants) \
			VALUES (1, 't', 'active', 1, 500, 1000, 2, 4), (2, 'u', 'full', 2, 500, 9999, 4, 4)",
		)
		.execute(match &store.backend {
			SqlBackend::Sqlite(pool) => pool,
			SqlBackend::Postgres(_) => unreachable!(),
		})
		.await
		.unwrap();

		let expired = store.list_expired_signals(2_000).await.unwrap();
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].id, SignalId(1));

		store.close_signal(SignalId(1)).await.unwrap();
		assert!(store.list_expired_signals(2_000).await.unwrap().is_empty());

		let unroomed = store.list_full_unroomed_signals().await.unwrap();
		assert_eq!(unroomed.len(), 1);
		assert_eq!(unroomed[0].id, SignalId(2));

		store.create_chat_room(SignalId(2), "u", 9_999).await.unwrap();
		assert!(store.list_full_unroomed_signals().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn memory_store_membership_and_scores() {
		let store = MemoryStore::new();
		store.insert_signal(signal(5, SignalStatus::Full));
		store.approve_participant(SignalId(5), UserId(2));

		assert!(store.can_join(SignalId(5), UserId(1)).await.unwrap(), "creator joins");
		assert!(store.can_join(SignalId(5), UserId(2)).await.unwrap(), "approved joins");
		assert!(!store.can_join(SignalId(5), UserId(3)).await.unwrap());
		assert!(!store.can_join(SignalId(6), UserId(1)).await.unwrap(), "unknown signal");

		let now = unix_ms_now();
		store.insert_rating(UserId(2), 5, false, now);
		store.insert_rating(UserId(2), 3, true, now);
		assert_eq!(store.recompute_manner_scores(86_400_000).await.unwrap(), 1);
		assert_eq!(store.manner_score_of(UserId(2)), Some(3.5));
	}
}
