#![forbid(unsafe_code)]

//! Storage contract consumed by the real-time core.
//!
//! Rooms, messages, receipts and attachments are owned by storage; sessions only go through
//! [`ChatStore`]. Provisioning calls (`create_user`, `create_room`, `private_room_between`) exist
//! for bootstrap and tests; the CRUD layer that normally owns them lives outside this crate.

mod bounded;
mod memory;
mod sql;

use chrono::{DateTime, Utc};
use parley_domain::{MessageId, MessageKind, PresenceStatus, RoomId, RoomKind, UserId};
use parley_protocol::UserSummary;

pub use bounded::{BoundedStore, BoundedStoreConfig};
pub use memory::InMemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub id: UserId,
	pub username: String,
	pub first_name: String,
	pub last_name: String,
}

impl UserRecord {
	pub fn summary(&self) -> UserSummary {
		UserSummary {
			id: self.id,
			username: self.username.clone(),
			first_name: self.first_name.clone(),
			last_name: self.last_name.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
	pub id: RoomId,
	pub kind: RoomKind,
	pub name: Option<String>,
	pub participants: Vec<UserId>,
	pub created_by: UserId,
	pub is_active: bool,
	pub updated_at: DateTime<Utc>,
}

impl Room {
	pub fn has_participant(&self, user: UserId) -> bool {
		self.participants.contains(&user)
	}
}

/// Result of the combined room lookup + membership check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAccess {
	Granted(Room),
	NotFound,
	Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub kind: MessageKind,
	pub content: String,
	pub created_at: DateTime<Utc>,
	pub is_edited: bool,
	pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
	pub id: i64,
	pub message_id: MessageId,
	pub file_name: String,
	pub file_size: u64,
	pub file_type: String,
	pub file_url: String,
}

/// Decoded upload handed to storage. The bytes become storage-owned.
#[derive(Debug, Clone, Copy)]
pub struct NewAttachment<'a> {
	pub bytes: &'a [u8],
	pub file_name: &'a str,
	pub file_type: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
	pub user_id: UserId,
	pub status: PresenceStatus,
	pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
	Recorded,
	AlreadyRead,
	/// The message does not exist or belongs to another room.
	MessageNotFound,
}

#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
	async fn user(&self, id: UserId) -> anyhow::Result<Option<UserRecord>>;

	async fn room_for_member(&self, room: RoomId, user: UserId) -> anyhow::Result<RoomAccess>;

	async fn active_rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>>;

	/// Persist a message and bump the room's `updated_at`.
	async fn create_message(
		&self,
		room: RoomId,
		sender: UserId,
		content: &str,
		kind: MessageKind,
	) -> anyhow::Result<StoredMessage>;

	async fn create_attachment(
		&self,
		message: &StoredMessage,
		upload: NewAttachment<'_>,
	) -> anyhow::Result<StoredAttachment>;

	/// Latest `limit` messages of a room, oldest first.
	async fn recent_messages(&self, room: RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>>;

	async fn attachments_for(&self, message: MessageId) -> anyhow::Result<Vec<StoredAttachment>>;

	async fn upsert_presence(&self, user: UserId, status: PresenceStatus) -> anyhow::Result<PresenceRecord>;

	async fn presence(&self, user: UserId) -> anyhow::Result<Option<PresenceRecord>>;

	/// Idempotent per `(message, user)`.
	async fn record_read(&self, room: RoomId, message: MessageId, user: UserId) -> anyhow::Result<ReadOutcome>;

	/// Messages in `room` neither sent nor read by `user`, oldest first.
	async fn unread_messages(&self, room: RoomId, user: UserId) -> anyhow::Result<Vec<MessageId>>;

	async fn readers_of(&self, message: MessageId) -> anyhow::Result<Vec<UserId>>;

	// Provisioning.

	async fn create_user(&self, username: &str, first_name: &str, last_name: &str) -> anyhow::Result<UserRecord>;

	async fn create_room(
		&self,
		kind: RoomKind,
		name: Option<&str>,
		created_by: UserId,
		participants: &[UserId],
	) -> anyhow::Result<Room>;

	/// Lookup-or-create the private room for an unordered user pair.
	async fn private_room_between(&self, a: UserId, b: UserId) -> anyhow::Result<Room>;
}

/// Public retrieval URL for a stored attachment.
pub(crate) fn attachment_url(
	media_base_url: &str,
	room: RoomId,
	file_name: &str,
	stored_at: DateTime<Utc>,
	key: uuid::Uuid,
) -> String {
	let safe_name: String = file_name
		.chars()
		.map(|c| if matches!(c, '/' | '\\' | '?' | '#') { '_' } else { c })
		.collect();

	format!(
		"{}/chat_files/{}/{}/{}-{}",
		media_base_url.trim_end_matches('/'),
		room,
		stored_at.format("%Y/%m/%d"),
		key.simple(),
		safe_name
	)
}

/// Normalize participants: sorted, deduplicated, creator included.
pub(crate) fn normalize_participants(created_by: UserId, participants: &[UserId]) -> Vec<UserId> {
	let mut out = participants.to_vec();
	out.push(created_by);
	out.sort();
	out.dedup();
	out
}

pub(crate) fn validate_room_shape(kind: RoomKind, participants: &[UserId]) -> anyhow::Result<()> {
	if kind == RoomKind::Private && participants.len() != 2 {
		anyhow::bail!("a private room needs exactly two participants, got {}", participants.len());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn attachment_url_is_dated_and_sanitized() {
		let at = DateTime::parse_from_rfc3339("2024-03-09T10:00:00Z").unwrap().with_timezone(&Utc);
		let key = uuid::Uuid::nil();
		let url = attachment_url("/media/", RoomId(4), "a/b?.pdf", at, key);
		assert_eq!(
			url,
			"/media/chat_files/4/2024/03/09/00000000000000000000000000000000-a_b_.pdf"
		);
	}

	#[test]
	fn private_rooms_need_two_participants() {
		let p = normalize_participants(UserId(2), &[UserId(1), UserId(2)]);
		assert_eq!(p, vec![UserId(1), UserId(2)]);
		assert!(validate_room_shape(RoomKind::Private, &p).is_ok());

		let solo = normalize_participants(UserId(1), &[UserId(1)]);
		assert!(validate_room_shape(RoomKind::Private, &solo).is_err());
		assert!(validate_room_shape(RoomKind::Group, &solo).is_ok());
	}

	#[tokio::test]
	async fn in_memory_private_room_is_unique_per_pair() {
		let store = std::sync::Arc::new(InMemoryStore::default());
		let alice = store.create_user("alice", "", "").await.unwrap().id;
		let bob = store.create_user("bob", "", "").await.unwrap().id;

		let calls: Vec<_> = (0..8)
			.map(|_| {
				let store = std::sync::Arc::clone(&store);
				tokio::spawn(async move { store.private_room_between(bob, alice).await })
			})
			.collect();
		let first = store.private_room_between(alice, bob).await.unwrap();
		for call in calls {
			assert_eq!(call.await.unwrap().unwrap().id, first.id);
		}

		assert!(store.create_room(RoomKind::Private, None, alice, &[bob]).await.is_err());
	}
}
