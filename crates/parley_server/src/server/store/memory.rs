#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::anyhow;
use chrono::{DateTime, TimeDelta, Utc};
use parley_domain::{MessageId, MessageKind, PresenceStatus, RoomId, RoomKind, UserId};
use tokio::sync::Mutex;

use super::{
	ChatStore, NewAttachment, PresenceRecord, ReadOutcome, Room, RoomAccess, StoredAttachment, StoredMessage,
	UserRecord, attachment_url, normalize_participants, validate_room_shape,
};

/// Process-local store for tests and dev runs without a database.
pub struct InMemoryStore {
	inner: Mutex<Inner>,
	media_base_url: String,
}

#[derive(Default)]
struct Inner {
	next_id: i64,
	users: BTreeMap<UserId, UserRecord>,
	rooms: BTreeMap<RoomId, Room>,
	messages: BTreeMap<MessageId, StoredMessage>,
	attachments: Vec<(StoredAttachment, Vec<u8>)>,
	reads: BTreeMap<MessageId, BTreeSet<UserId>>,
	presence: HashMap<UserId, PresenceRecord>,
	last_message_at: Option<DateTime<Utc>>,
}

impl Inner {
	fn next_id(&mut self) -> i64 {
		self.next_id += 1;
		self.next_id
	}

	// Message timestamps are strictly increasing even when the clock does not move.
	fn next_message_time(&mut self) -> DateTime<Utc> {
		let now = Utc::now();
		let at = match self.last_message_at {
			Some(last) if now <= last => last + TimeDelta::microseconds(1),
			_ => now,
		};
		self.last_message_at = Some(at);
		at
	}
}

impl InMemoryStore {
	pub fn new(media_base_url: impl Into<String>) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			media_base_url: media_base_url.into(),
		}
	}

	/// Flip a room's active flag.
	pub async fn set_room_active(&self, room: RoomId, active: bool) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let room = inner.rooms.get_mut(&room).ok_or_else(|| anyhow!("room {room} not found"))?;
		room.is_active = active;
		Ok(())
	}

	/// Add `user` to an existing room.
	pub async fn add_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let room = inner.rooms.get_mut(&room).ok_or_else(|| anyhow!("room {room} not found"))?;
		if let Err(at) = room.participants.binary_search(&user) {
			room.participants.insert(at, user);
		}
		Ok(())
	}

	/// Number of stored attachments.
	pub async fn attachment_count(&self) -> usize {
		self.inner.lock().await.attachments.len()
	}
}

impl Default for InMemoryStore {
	fn default() -> Self {
		Self::new("/media")
	}
}

#[async_trait::async_trait]
impl ChatStore for InMemoryStore {
	async fn user(&self, id: UserId) -> anyhow::Result<Option<UserRecord>> {
		Ok(self.inner.lock().await.users.get(&id).cloned())
	}

	async fn room_for_member(&self, room: RoomId, user: UserId) -> anyhow::Result<RoomAccess> {
		let inner = self.inner.lock().await;
		Ok(match inner.rooms.get(&room) {
			Some(r) if !r.is_active => RoomAccess::NotFound,
			Some(r) if r.has_participant(user) => RoomAccess::Granted(r.clone()),
			Some(_) => RoomAccess::Forbidden,
			None => RoomAccess::NotFound,
		})
	}

	async fn active_rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.rooms
			.values()
			.filter(|r| r.is_active && r.has_participant(user))
			.cloned()
			.collect())
	}

	async fn create_message(
		&self,
		room: RoomId,
		sender: UserId,
		content: &str,
		kind: MessageKind,
	) -> anyhow::Result<StoredMessage> {
		let mut inner = self.inner.lock().await;
		if !inner.rooms.contains_key(&room) {
			return Err(anyhow!("room {room} not found"));
		}

		let id = MessageId(inner.next_id());
		let created_at = inner.next_message_time();
		let msg = StoredMessage {
			id,
			room_id: room,
			sender_id: sender,
			kind,
			content: content.to_string(),
			created_at,
			is_edited: false,
			edited_at: None,
		};
		inner.messages.insert(id, msg.clone());
		if let Some(r) = inner.rooms.get_mut(&room) {
			r.updated_at = created_at;
		}

		Ok(msg)
	}

	async fn create_attachment(
		&self,
		message: &StoredMessage,
		upload: NewAttachment<'_>,
	) -> anyhow::Result<StoredAttachment> {
		let mut inner = self.inner.lock().await;
		if !inner.messages.contains_key(&message.id) {
			return Err(anyhow!("message {} not found", message.id));
		}

		let id = inner.next_id();
		let attachment = StoredAttachment {
			id,
			message_id: message.id,
			file_name: upload.file_name.to_string(),
			file_size: upload.bytes.len() as u64,
			file_type: upload.file_type.to_string(),
			file_url: attachment_url(
				&self.media_base_url,
				message.room_id,
				upload.file_name,
				Utc::now(),
				uuid::Uuid::new_v4(),
			),
		};
		inner.attachments.push((attachment.clone(), upload.bytes.to_vec()));
		Ok(attachment)
	}

	async fn recent_messages(&self, room: RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		let inner = self.inner.lock().await;
		let mut out: Vec<StoredMessage> = inner
			.messages
			.values()
			.rev()
			.filter(|m| m.room_id == room)
			.take(limit)
			.cloned()
			.collect();
		out.reverse();
		Ok(out)
	}

	async fn attachments_for(&self, message: MessageId) -> anyhow::Result<Vec<StoredAttachment>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.attachments
			.iter()
			.filter(|(a, _)| a.message_id == message)
			.map(|(a, _)| a.clone())
			.collect())
	}

	async fn upsert_presence(&self, user: UserId, status: PresenceStatus) -> anyhow::Result<PresenceRecord> {
		let record = PresenceRecord {
			user_id: user,
			status,
			last_seen: Utc::now(),
		};
		self.inner.lock().await.presence.insert(user, record.clone());
		Ok(record)
	}

	async fn presence(&self, user: UserId) -> anyhow::Result<Option<PresenceRecord>> {
		Ok(self.inner.lock().await.presence.get(&user).cloned())
	}

	async fn record_read(&self, room: RoomId, message: MessageId, user: UserId) -> anyhow::Result<ReadOutcome> {
		let mut inner = self.inner.lock().await;
		match inner.messages.get(&message) {
			Some(m) if m.room_id == room => {}
			_ => return Ok(ReadOutcome::MessageNotFound),
		}

		if inner.reads.entry(message).or_default().insert(user) {
			Ok(ReadOutcome::Recorded)
		} else {
			Ok(ReadOutcome::AlreadyRead)
		}
	}

	async fn unread_messages(&self, room: RoomId, user: UserId) -> anyhow::Result<Vec<MessageId>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.messages
			.values()
			.filter(|m| m.room_id == room && m.sender_id != user)
			.filter(|m| !inner.reads.get(&m.id).is_some_and(|r| r.contains(&user)))
			.map(|m| m.id)
			.collect())
	}

	async fn readers_of(&self, message: MessageId) -> anyhow::Result<Vec<UserId>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.reads
			.get(&message)
			.map(|r| r.iter().copied().collect())
			.unwrap_or_default())
	}

	async fn create_user(&self, username: &str, first_name: &str, last_name: &str) -> anyhow::Result<UserRecord> {
		let mut inner = self.inner.lock().await;
		if inner.users.values().any(|u| u.username == username) {
			return Err(anyhow!("username {username:?} is taken"));
		}

		let user = UserRecord {
			id: UserId(inner.next_id()),
			username: username.to_string(),
			first_name: first_name.to_string(),
			last_name: last_name.to_string(),
		};
		inner.users.insert(user.id, user.clone());
		Ok(user)
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

		let mut inner = self.inner.lock().await;
		if kind == RoomKind::Private
			&& inner
				.rooms
				.values()
				.any(|r| r.kind == RoomKind::Private && r.participants == participants)
		{
			anyhow::bail!("a private room between these users already exists");
		}
		let room = Room {
			id: RoomId(inner.next_id()),
			kind,
			name: name.map(str::to_string),
			participants,
			created_by,
			is_active: true,
			updated_at: Utc::now(),
		};
		inner.rooms.insert(room.id, room.clone());
		Ok(room)
	}

	async fn private_room_between(&self, a: UserId, b: UserId) -> anyhow::Result<Room> {
		let pair = normalize_participants(a, &[b]);
		validate_room_shape(RoomKind::Private, &pair)?;

		{
			let inner = self.inner.lock().await;
			if let Some(existing) = inner
				.rooms
				.values()
				.find(|r| r.kind == RoomKind::Private && r.participants == pair)
			{
				return Ok(existing.clone());
			}
		}

		// Two concurrent callers may both miss above; re-check before inserting.
		let mut inner = self.inner.lock().await;
		if let Some(existing) = inner
			.rooms
			.values()
			.find(|r| r.kind == RoomKind::Private && r.participants == pair)
		{
			return Ok(existing.clone());
		}

		let room = Room {
			id: RoomId(inner.next_id()),
			kind: RoomKind::Private,
			name: None,
			participants: pair,
			created_by: a,
			is_active: true,
			updated_at: Utc::now(),
		};
		inner.rooms.insert(room.id, room.clone());
		Ok(room)
	}
}
