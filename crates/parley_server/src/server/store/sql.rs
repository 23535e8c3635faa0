#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use chrono::{DateTime, SubsecRound as _, Utc};
use parley_domain::{MessageId, MessageKind, PresenceStatus, RoomId, RoomKind, UserId};

use super::{
	ChatStore, NewAttachment, PresenceRecord, ReadOutcome, Room, RoomAccess, StoredAttachment, StoredMessage,
	UserRecord, attachment_url, normalize_participants, validate_room_shape,
};

type UserRow = (i64, String, String, String);
type RoomRow = (i64, String, Option<String>, i64, bool, DateTime<Utc>);
type MessageRow = (i64, i64, i64, String, String, DateTime<Utc>, bool, Option<DateTime<Utc>>);
type AttachmentRow = (i64, i64, String, i64, String, String);

// Postgres keeps microseconds. Values handed back to callers must match what a later read returns.
fn db_now() -> DateTime<Utc> {
	Utc::now().trunc_subsecs(6)
}

/// Unique key of the private room between two users, independent of argument order.
fn private_pair_key(a: UserId, b: UserId) -> String {
	format!("{}:{}", a.0.min(b.0), a.0.max(b.0))
}

/// sqlx-backed store. SQLite and Postgres are supported.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
	media_base_url: String,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str, media_base_url: impl Into<String>) -> anyhow::Result<Self> {
		let media_base_url = media_base_url.into();
		if database_url.starts_with("sqlite:") {
			// An in-memory database lives and dies with its connection.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 10 };
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
				media_base_url,
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
				media_base_url,
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match &self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
		}
	}

	async fn participants(&self, room: i64) -> anyhow::Result<Vec<UserId>> {
		let rows: Vec<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM room_participants WHERE room_id = ? ORDER BY user_id")
					.bind(room)
					.fetch_all(pool)
					.await
					.context("select participants (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM room_participants WHERE room_id = $1 ORDER BY user_id")
					.bind(room)
					.fetch_all(pool)
					.await
					.context("select participants (postgres)")?
			}
		};
		Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
	}

	async fn room_by_id(&self, room: i64) -> anyhow::Result<Option<Room>> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, kind, name, created_by, is_active, updated_at FROM rooms WHERE id = ?",
			)
			.bind(room)
			.fetch_optional(pool)
			.await
			.context("select room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, kind, name, created_by, is_active, updated_at FROM rooms WHERE id = $1",
			)
			.bind(room)
			.fetch_optional(pool)
			.await
			.context("select room (postgres)")?,
		};

		match row {
			Some(row) => {
				let participants = self.participants(row.0).await?;
				Ok(Some(room_from_row(row, participants)?))
			}
			None => Ok(None),
		}
	}

	async fn find_private_room(&self, key: &str) -> anyhow::Result<Option<i64>> {
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id FROM rooms WHERE pair_key = ?")
				.bind(key)
				.fetch_optional(pool)
				.await
				.context("find private room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id FROM rooms WHERE pair_key = $1")
				.bind(key)
				.fetch_optional(pool)
				.await
				.context("find private room (postgres)")?,
		};
		Ok(row.map(|(id,)| id))
	}

	/// Inserts the room and its participants in one transaction. Returns `None` when `pair_key` is already taken.
	async fn insert_room(
		&self,
		kind: RoomKind,
		name: Option<&str>,
		created_by: UserId,
		participants: &[UserId],
		pair_key: Option<&str>,
	) -> anyhow::Result<Option<i64>> {
		let now = db_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let row: Option<(i64,)> = sqlx::query_as(
					"INSERT INTO rooms (kind, name, created_by, is_active, pair_key, created_at, updated_at) \
					VALUES (?, ?, ?, 1, ?, ?, ?) ON CONFLICT (pair_key) DO NOTHING RETURNING id",
				)
				.bind(kind.as_str())
				.bind(name)
				.bind(created_by.0)
				.bind(pair_key)
				.bind(now)
				.bind(now)
				.fetch_optional(&mut *tx)
				.await
				.context("insert room (sqlite)")?;
				let Some((id,)) = row else {
					return Ok(None);
				};

				for user in participants {
					sqlx::query("INSERT INTO room_participants (room_id, user_id) VALUES (?, ?)")
						.bind(id)
						.bind(user.0)
						.execute(&mut *tx)
						.await
						.context("insert participant (sqlite)")?;
				}

				tx.commit().await.context("commit sqlite tx")?;
				Ok(Some(id))
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let row: Option<(i64,)> = sqlx::query_as(
					"INSERT INTO rooms (kind, name, created_by, is_active, pair_key, created_at, updated_at) \
					VALUES ($1, $2, $3, TRUE, $4, $5, $6) ON CONFLICT (pair_key) DO NOTHING RETURNING id",
				)
				.bind(kind.as_str())
				.bind(name)
				.bind(created_by.0)
				.bind(pair_key)
				.bind(now)
				.bind(now)
				.fetch_optional(&mut *tx)
				.await
				.context("insert room (postgres)")?;
				let Some((id,)) = row else {
					return Ok(None);
				};

				for user in participants {
					sqlx::query("INSERT INTO room_participants (room_id, user_id) VALUES ($1, $2)")
						.bind(id)
						.bind(user.0)
						.execute(&mut *tx)
						.await
						.context("insert participant (postgres)")?;
				}

				tx.commit().await.context("commit postgres tx")?;
				Ok(Some(id))
			}
		}
	}

	async fn message_room(&self, message: MessageId) -> anyhow::Result<Option<i64>> {
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT room_id FROM messages WHERE id = ?")
				.bind(message.0)
				.fetch_optional(pool)
				.await
				.context("select message room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT room_id FROM messages WHERE id = $1")
				.bind(message.0)
				.fetch_optional(pool)
				.await
				.context("select message room (postgres)")?,
		};
		Ok(row.map(|(id,)| id))
	}
}

fn room_from_row(row: RoomRow, participants: Vec<UserId>) -> anyhow::Result<Room> {
	let (id, kind, name, created_by, is_active, updated_at) = row;
	Ok(Room {
		id: RoomId(id),
		kind: kind.parse::<RoomKind>().context("decode room kind")?,
		name,
		participants,
		created_by: UserId(created_by),
		is_active,
		updated_at,
	})
}

fn message_from_row(row: MessageRow) -> anyhow::Result<StoredMessage> {
	let (id, room_id, sender_id, kind, content, created_at, is_edited, edited_at) = row;
	Ok(StoredMessage {
		id: MessageId(id),
		room_id: RoomId(room_id),
		sender_id: UserId(sender_id),
		kind: kind.parse::<MessageKind>().context("decode message kind")?,
		content,
		created_at,
		is_edited,
		edited_at,
	})
}

fn attachment_from_row(row: AttachmentRow) -> StoredAttachment {
	let (id, message_id, file_name, file_size, file_type, file_url) = row;
	StoredAttachment {
		id,
		message_id: MessageId(message_id),
		file_name,
		file_size: file_size.max(0) as u64,
		file_type,
		file_url,
	}
}

fn user_from_row(row: UserRow) -> UserRecord {
	let (id, username, first_name, last_name) = row;
	UserRecord {
		id: UserId(id),
		username,
		first_name,
		last_name,
	}
}

#[async_trait::async_trait]
impl ChatStore for SqlStore {
	async fn user(&self, id: UserId) -> anyhow::Result<Option<UserRecord>> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, username, first_name, last_name FROM users WHERE id = ?")
					.bind(id.0)
					.fetch_optional(pool)
					.await
					.context("select user (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, username, first_name, last_name FROM users WHERE id = $1")
					.bind(id.0)
					.fetch_optional(pool)
					.await
					.context("select user (postgres)")?
			}
		};
		Ok(row.map(user_from_row))
	}

	async fn room_for_member(&self, room: RoomId, user: UserId) -> anyhow::Result<RoomAccess> {
		Ok(match self.room_by_id(room.0).await? {
			Some(r) if !r.is_active => RoomAccess::NotFound,
			Some(r) if r.has_participant(user) => RoomAccess::Granted(r),
			Some(_) => RoomAccess::Forbidden,
			None => RoomAccess::NotFound,
		})
	}

	async fn active_rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>> {
		let rows: Vec<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT r.id, r.kind, r.name, r.created_by, r.is_active, r.updated_at FROM rooms r \
				JOIN room_participants p ON p.room_id = r.id \
				WHERE p.user_id = ? AND r.is_active = 1 ORDER BY r.id",
			)
			.bind(user.0)
			.fetch_all(pool)
			.await
			.context("select rooms for user (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT r.id, r.kind, r.name, r.created_by, r.is_active, r.updated_at FROM rooms r \
				JOIN room_participants p ON p.room_id = r.id \
				WHERE p.user_id = $1 AND r.is_active ORDER BY r.id",
			)
			.bind(user.0)
			.fetch_all(pool)
			.await
			.context("select rooms for user (postgres)")?,
		};

		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			let participants = self.participants(row.0).await?;
			out.push(room_from_row(row, participants)?);
		}
		Ok(out)
	}

	async fn create_message(
		&self,
		room: RoomId,
		sender: UserId,
		content: &str,
		kind: MessageKind,
	) -> anyhow::Result<StoredMessage> {
		let now = db_now();
		let (id,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let row = sqlx::query_as(
					"INSERT INTO messages (room_id, sender_id, kind, content, created_at, is_edited) \
					VALUES (?, ?, ?, ?, ?, 0) RETURNING id",
				)
				.bind(room.0)
				.bind(sender.0)
				.bind(kind.as_str())
				.bind(content)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert message (sqlite)")?;

				sqlx::query("UPDATE rooms SET updated_at = ? WHERE id = ?")
					.bind(now)
					.bind(room.0)
					.execute(&mut *tx)
					.await
					.context("touch room (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				row
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let row = sqlx::query_as(
					"INSERT INTO messages (room_id, sender_id, kind, content, created_at, is_edited) \
					VALUES ($1, $2, $3, $4, $5, FALSE) RETURNING id",
				)
				.bind(room.0)
				.bind(sender.0)
				.bind(kind.as_str())
				.bind(content)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert message (postgres)")?;

				sqlx::query("UPDATE rooms SET updated_at = $1 WHERE id = $2")
					.bind(now)
					.bind(room.0)
					.execute(&mut *tx)
					.await
					.context("touch room (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				row
			}
		};

		Ok(StoredMessage {
			id: MessageId(id),
			room_id: room,
			sender_id: sender,
			kind,
			content: content.to_string(),
			created_at: now,
			is_edited: false,
			edited_at: None,
		})
	}

	async fn create_attachment(
		&self,
		message: &StoredMessage,
		upload: NewAttachment<'_>,
	) -> anyhow::Result<StoredAttachment> {
		let now = db_now();
		let file_url = attachment_url(
			&self.media_base_url,
			message.room_id,
			upload.file_name,
			now,
			uuid::Uuid::new_v4(),
		);
		let file_size = upload.bytes.len() as i64;

		let (id,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO file_attachments (message_id, file_name, file_size, file_type, file_url, data, uploaded_at) \
				VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
			)
			.bind(message.id.0)
			.bind(upload.file_name)
			.bind(file_size)
			.bind(upload.file_type)
			.bind(&file_url)
			.bind(upload.bytes)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert attachment (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO file_attachments (message_id, file_name, file_size, file_type, file_url, data, uploaded_at) \
				VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
			)
			.bind(message.id.0)
			.bind(upload.file_name)
			.bind(file_size)
			.bind(upload.file_type)
			.bind(&file_url)
			.bind(upload.bytes)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert attachment (postgres)")?,
		};

		Ok(StoredAttachment {
			id,
			message_id: message.id,
			file_name: upload.file_name.to_string(),
			file_size: upload.bytes.len() as u64,
			file_type: upload.file_type.to_string(),
			file_url,
		})
	}

	async fn recent_messages(&self, room: RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_id, sender_id, kind, content, created_at, is_edited, edited_at FROM messages \
				WHERE room_id = ? ORDER BY id DESC LIMIT ?",
			)
			.bind(room.0)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_id, sender_id, kind, content, created_at, is_edited, edited_at FROM messages \
				WHERE room_id = $1 ORDER BY id DESC LIMIT $2",
			)
			.bind(room.0)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent messages (postgres)")?,
		};

		let mut out = rows.into_iter().map(message_from_row).collect::<anyhow::Result<Vec<_>>>()?;
		out.reverse();
		Ok(out)
	}

	async fn attachments_for(&self, message: MessageId) -> anyhow::Result<Vec<StoredAttachment>> {
		let rows: Vec<AttachmentRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, message_id, file_name, file_size, file_type, file_url FROM file_attachments \
				WHERE message_id = ? ORDER BY id",
			)
			.bind(message.0)
			.fetch_all(pool)
			.await
			.context("select attachments (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, message_id, file_name, file_size, file_type, file_url FROM file_attachments \
				WHERE message_id = $1 ORDER BY id",
			)
			.bind(message.0)
			.fetch_all(pool)
			.await
			.context("select attachments (postgres)")?,
		};
		Ok(rows.into_iter().map(attachment_from_row).collect())
	}

	async fn upsert_presence(&self, user: UserId, status: PresenceStatus) -> anyhow::Result<PresenceRecord> {
		let now = db_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO user_status (user_id, status, last_seen) VALUES (?, ?, ?) \
					ON CONFLICT(user_id) DO UPDATE SET status = excluded.status, last_seen = excluded.last_seen",
				)
				.bind(user.0)
				.bind(status.as_str())
				.bind(now)
				.execute(pool)
				.await
				.context("upsert presence (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO user_status (user_id, status, last_seen) VALUES ($1, $2, $3) \
					ON CONFLICT (user_id) DO UPDATE SET status = EXCLUDED.status, last_seen = EXCLUDED.last_seen",
				)
				.bind(user.0)
				.bind(status.as_str())
				.bind(now)
				.execute(pool)
				.await
				.context("upsert presence (postgres)")?;
			}
		}

		Ok(PresenceRecord {
			user_id: user,
			status,
			last_seen: now,
		})
	}

	async fn presence(&self, user: UserId) -> anyhow::Result<Option<PresenceRecord>> {
		let row: Option<(String, DateTime<Utc>)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT status, last_seen FROM user_status WHERE user_id = ?")
				.bind(user.0)
				.fetch_optional(pool)
				.await
				.context("select presence (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT status, last_seen FROM user_status WHERE user_id = $1")
					.bind(user.0)
					.fetch_optional(pool)
					.await
					.context("select presence (postgres)")?
			}
		};

		row.map(|(status, last_seen)| {
			Ok(PresenceRecord {
				user_id: user,
				status: status.parse::<PresenceStatus>().context("decode presence status")?,
				last_seen,
			})
		})
		.transpose()
	}

	async fn record_read(&self, room: RoomId, message: MessageId, user: UserId) -> anyhow::Result<ReadOutcome> {
		if self.message_room(message).await? != Some(room.0) {
			return Ok(ReadOutcome::MessageNotFound);
		}

		let now = db_now();
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?) \
				ON CONFLICT(message_id, user_id) DO NOTHING",
			)
			.bind(message.0)
			.bind(user.0)
			.bind(now)
			.execute(pool)
			.await
			.context("insert read (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"INSERT INTO message_reads (message_id, user_id, read_at) VALUES ($1, $2, $3) \
				ON CONFLICT (message_id, user_id) DO NOTHING",
			)
			.bind(message.0)
			.bind(user.0)
			.bind(now)
			.execute(pool)
			.await
			.context("insert read (postgres)")?
			.rows_affected(),
		};

		Ok(if affected > 0 {
			ReadOutcome::Recorded
		} else {
			ReadOutcome::AlreadyRead
		})
	}

	async fn unread_messages(&self, room: RoomId, user: UserId) -> anyhow::Result<Vec<MessageId>> {
		let rows: Vec<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT m.id FROM messages m WHERE m.room_id = ? AND m.sender_id <> ? \
				AND NOT EXISTS (SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?) \
				ORDER BY m.id",
			)
			.bind(room.0)
			.bind(user.0)
			.bind(user.0)
			.fetch_all(pool)
			.await
			.context("select unread (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT m.id FROM messages m WHERE m.room_id = $1 AND m.sender_id <> $2 \
				AND NOT EXISTS (SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = $2) \
				ORDER BY m.id",
			)
			.bind(room.0)
			.bind(user.0)
			.fetch_all(pool)
			.await
			.context("select unread (postgres)")?,
		};
		Ok(rows.into_iter().map(|(id,)| MessageId(id)).collect())
	}

	async fn readers_of(&self, message: MessageId) -> anyhow::Result<Vec<UserId>> {
		let rows: Vec<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM message_reads WHERE message_id = ? ORDER BY user_id")
					.bind(message.0)
					.fetch_all(pool)
					.await
					.context("select readers (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM message_reads WHERE message_id = $1 ORDER BY user_id")
					.bind(message.0)
					.fetch_all(pool)
					.await
					.context("select readers (postgres)")?
			}
		};
		Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
	}

	async fn create_user(&self, username: &str, first_name: &str, last_name: &str) -> anyhow::Result<UserRecord> {
		let (id,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("INSERT INTO users (username, first_name, last_name) VALUES (?, ?, ?) RETURNING id")
					.bind(username)
					.bind(first_name)
					.bind(last_name)
					.fetch_one(pool)
					.await
					.context("insert user (sqlite)")?
			}
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO users (username, first_name, last_name) VALUES ($1, $2, $3) RETURNING id",
			)
			.bind(username)
			.bind(first_name)
			.bind(last_name)
			.fetch_one(pool)
			.await
			.context("insert user (postgres)")?,
		};

		Ok(UserRecord {
			id: UserId(id),
			username: username.to_string(),
			first_name: first_name.to_string(),
			last_name: last_name.to_string(),
		})
	}

	async fn create_room(
		&self,
		kind: RoomKind,
		name: Option<&str>,
		created_by: UserId,
		participants: &[UserId],
	) -> anyhow::Result<Room> {
		let participants = normalize_participants(created_by, participants);
		validate_room_shape(kind, &participants)?;

		let pair_key = match (kind, participants.as_slice()) {
			(RoomKind::Private, [a, b]) => Some(private_pair_key(*a, *b)),
			_ => None,
		};
		let id = self
			.insert_room(kind, name, created_by, &participants, pair_key.as_deref())
			.await?
			.ok_or_else(|| anyhow!("a private room between these users already exists"))?;
		self.room_by_id(id)
			.await?
			.ok_or_else(|| anyhow!("room {id} vanished after insert"))
	}

	async fn private_room_between(&self, a: UserId, b: UserId) -> anyhow::Result<Room> {
		let pair = normalize_participants(a, &[b]);
		validate_room_shape(RoomKind::Private, &pair)?;
		let key = private_pair_key(a, b);

		let id = match self.find_private_room(&key).await? {
			Some(id) => id,
			// A concurrent caller may win the insert; its room is then picked up by the re-select.
			None => match self.insert_room(RoomKind::Private, None, a, &pair, Some(&key)).await? {
				Some(id) => id,
				None => self
					.find_private_room(&key)
					.await?
					.ok_or_else(|| anyhow!("private room {key} missing after insert conflict"))?,
			},
		};

		self.room_by_id(id).await?.ok_or_else(|| anyhow!("room {id} not found"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn sqlite() -> SqlStore {
		SqlStore::connect("sqlite::memory:", "/media").await.unwrap()
	}

	#[tokio::test]
	async fn sqlite_round_trips_rooms_and_messages() {
		let store = sqlite().await;
		assert_eq!(store.backend_name(), "sqlite");

		let alice = store.create_user("alice", "Alice", "A").await.unwrap();
		let bob = store.create_user("bob", "", "").await.unwrap();
		let eve = store.create_user("eve", "", "").await.unwrap();

		let room = store.private_room_between(alice.id, bob.id).await.unwrap();
		assert_eq!(room.participants, vec![alice.id, bob.id]);
		let again = store.private_room_between(bob.id, alice.id).await.unwrap();
		assert_eq!(again.id, room.id);

		assert!(matches!(
			store.room_for_member(room.id, alice.id).await.unwrap(),
			RoomAccess::Granted(_)
		));
		assert_eq!(store.room_for_member(room.id, eve.id).await.unwrap(), RoomAccess::Forbidden);
		assert_eq!(
			store.room_for_member(RoomId(9999), alice.id).await.unwrap(),
			RoomAccess::NotFound
		);

		let m1 = store.create_message(room.id, alice.id, "hi", MessageKind::Text).await.unwrap();
		let m2 = store.create_message(room.id, bob.id, "yo", MessageKind::Text).await.unwrap();
		let recent = store.recent_messages(room.id, 10).await.unwrap();
		assert_eq!(recent.iter().map(|m| m.id).collect::<Vec<_>>(), vec![m1.id, m2.id]);

		assert_eq!(store.unread_messages(room.id, bob.id).await.unwrap(), vec![m1.id]);
		assert_eq!(
			store.record_read(room.id, m1.id, bob.id).await.unwrap(),
			ReadOutcome::Recorded
		);
		assert_eq!(
			store.record_read(room.id, m1.id, bob.id).await.unwrap(),
			ReadOutcome::AlreadyRead
		);
		assert_eq!(store.readers_of(m1.id).await.unwrap(), vec![bob.id]);
		assert!(store.unread_messages(room.id, bob.id).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn concurrent_private_room_lookups_share_one_room() {
		let dir = tempfile::tempdir().unwrap();
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("parley.db").display());
		let store = SqlStore::connect(&url, "/media").await.unwrap();
		let alice = store.create_user("alice", "", "").await.unwrap();
		let bob = store.create_user("bob", "", "").await.unwrap();

		let calls = (0..8).map(|i| {
			let store = store.clone();
			let (a, b) = if i % 2 == 0 { (alice.id, bob.id) } else { (bob.id, alice.id) };
			tokio::spawn(async move { store.private_room_between(a, b).await })
		});
		let mut ids = Vec::new();
		for call in calls.collect::<Vec<_>>() {
			let room = call.await.unwrap().unwrap();
			assert_eq!(room.participants, vec![alice.id, bob.id]);
			ids.push(room.id);
		}
		ids.dedup();
		assert_eq!(ids.len(), 1, "expected one private room, got {ids:?}");

		let err = store
			.create_room(RoomKind::Private, None, alice.id, &[bob.id])
			.await
			.unwrap_err();
		assert!(err.to_string().contains("already exists"), "{err:#}");
		assert_eq!(store.active_rooms_for_user(alice.id).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn returned_timestamps_match_stored_ones() {
		let store = sqlite().await;
		let alice = store.create_user("alice", "", "").await.unwrap();
		let room = store.create_room(RoomKind::Group, Some("team"), alice.id, &[]).await.unwrap();

		let sent = store.create_message(room.id, alice.id, "hi", MessageKind::Text).await.unwrap();
		assert_eq!(sent.created_at.timestamp_subsec_nanos() % 1_000, 0);
		let history = store.recent_messages(room.id, 1).await.unwrap();
		assert_eq!(history[0].created_at, sent.created_at);

		let presence = store.upsert_presence(alice.id, PresenceStatus::Online).await.unwrap();
		assert_eq!(store.presence(alice.id).await.unwrap().unwrap().last_seen, presence.last_seen);
	}

	#[tokio::test]
	async fn sqlite_stores_attachments_and_presence() {
		let store = sqlite().await;
		let alice = store.create_user("alice", "", "").await.unwrap();
		let room = store.create_room(RoomKind::Group, Some("team"), alice.id, &[]).await.unwrap();

		let msg = store
			.create_message(room.id, alice.id, "Shared a file: a.txt", MessageKind::File)
			.await
			.unwrap();
		let att = store
			.create_attachment(
				&msg,
				NewAttachment {
					bytes: b"hello",
					file_name: "a.txt",
					file_type: "text/plain",
				},
			)
			.await
			.unwrap();
		assert_eq!(att.file_size, 5);
		assert!(att.file_url.starts_with(&format!("/media/chat_files/{}/", room.id)));
		assert_eq!(store.attachments_for(msg.id).await.unwrap(), vec![att]);

		store.upsert_presence(alice.id, PresenceStatus::Online).await.unwrap();
		store.upsert_presence(alice.id, PresenceStatus::Offline).await.unwrap();
		let p = store.presence(alice.id).await.unwrap().unwrap();
		assert_eq!(p.status, PresenceStatus::Offline);
	}
}
