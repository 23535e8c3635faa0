#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use parley_domain::{MessageId, MessageKind, PresenceStatus, RoomId, RoomKind, UserId};
use tokio::sync::Semaphore;

use super::{
	ChatStore, NewAttachment, PresenceRecord, ReadOutcome, Room, RoomAccess, StoredAttachment, StoredMessage,
	UserRecord,
};

#[derive(Debug, Clone)]
pub struct BoundedStoreConfig {
	/// Maximum storage calls in flight across all sessions.
	pub max_inflight: usize,

	/// Upper bound for a single storage call, including the wait for a permit.
	pub call_timeout: Duration,
}

impl Default for BoundedStoreConfig {
	fn default() -> Self {
		Self {
			max_inflight: 64,
			call_timeout: Duration::from_secs(10),
		}
	}
}

/// Wraps a store so storage latency cannot pile up unbounded work.
pub struct BoundedStore {
	inner: Arc<dyn ChatStore>,
	permits: Semaphore,
	cfg: BoundedStoreConfig,
}

impl BoundedStore {
	pub fn new(inner: Arc<dyn ChatStore>, cfg: BoundedStoreConfig) -> Self {
		Self {
			inner,
			permits: Semaphore::new(cfg.max_inflight.max(1)),
			cfg,
		}
	}

	async fn guarded<T, F>(&self, op: &'static str, fut: F) -> anyhow::Result<T>
	where
		F: Future<Output = anyhow::Result<T>> + Send,
	{
		let started = std::time::Instant::now();
		let res = tokio::time::timeout(self.cfg.call_timeout, async {
			let _permit = self.permits.acquire().await.context("store semaphore closed")?;
			fut.await
		})
		.await;

		metrics::histogram!("parley_server_store_call_ms", "op" => op).record(started.elapsed().as_secs_f64() * 1000.0);

		match res {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(e)) => {
				metrics::counter!("parley_server_store_errors_total", "op" => op).increment(1);
				Err(e.context(op))
			}
			Err(_) => {
				metrics::counter!("parley_server_store_timeouts_total", "op" => op).increment(1);
				Err(anyhow!("{op}: storage call timed out after {:?}", self.cfg.call_timeout))
			}
		}
	}
}

#[async_trait::async_trait]
impl ChatStore for BoundedStore {
	async fn user(&self, id: UserId) -> anyhow::Result<Option<UserRecord>> {
		self.guarded("user", self.inner.user(id)).await
	}

	async fn room_for_member(&self, room: RoomId, user: UserId) -> anyhow::Result<RoomAccess> {
		self.guarded("room_for_member", self.inner.room_for_member(room, user)).await
	}

	async fn active_rooms_for_user(&self, user: UserId) -> anyhow::Result<Vec<Room>> {
		self.guarded("active_rooms_for_user", self.inner.active_rooms_for_user(user))
			.await
	}

	async fn create_message(
		&self,
		room: RoomId,
		sender: UserId,
		content: &str,
		kind: MessageKind,
	) -> anyhow::Result<StoredMessage> {
		self.guarded("create_message", self.inner.create_message(room, sender, content, kind))
			.await
	}

	async fn create_attachment(
		&self,
		message: &StoredMessage,
		upload: NewAttachment<'_>,
	) -> anyhow::Result<StoredAttachment> {
		self.guarded("create_attachment", self.inner.create_attachment(message, upload))
			.await
	}

	async fn recent_messages(&self, room: RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		self.guarded("recent_messages", self.inner.recent_messages(room, limit)).await
	}

	async fn attachments_for(&self, message: MessageId) -> anyhow::Result<Vec<StoredAttachment>> {
		self.guarded("attachments_for", self.inner.attachments_for(message)).await
	}

	async fn upsert_presence(&self, user: UserId, status: PresenceStatus) -> anyhow::Result<PresenceRecord> {
		self.guarded("upsert_presence", self.inner.upsert_presence(user, status)).await
	}

	async fn presence(&self, user: UserId) -> anyhow::Result<Option<PresenceRecord>> {
		self.guarded("presence", self.inner.presence(user)).await
	}

	async fn record_read(&self, room: RoomId, message: MessageId, user: UserId) -> anyhow::Result<ReadOutcome> {
		self.guarded("record_read", self.inner.record_read(room, message, user)).await
	}

	async fn unread_messages(&self, room: RoomId, user: UserId) -> anyhow::Result<Vec<MessageId>> {
		self.guarded("unread_messages", self.inner.unread_messages(room, user)).await
	}

	async fn readers_of(&self, message: MessageId) -> anyhow::Result<Vec<UserId>> {
		self.guarded("readers_of", self.inner.readers_of(message)).await
	}

	async fn create_user(&self, username: &str, first_name: &str, last_name: &str) -> anyhow::Result<UserRecord> {
		self.guarded("create_user", self.inner.create_user(username, first_name, last_name))
			.await
	}

	async fn create_room(
		&self,
		kind: RoomKind,
		name: Option<&str>,
		created_by: UserId,
		participants: &[UserId],
	) -> anyhow::Result<Room> {
		self.guarded(
			"create_room",
			self.inner.create_room(kind, name, created_by, participants),
		)
		.await
	}

	async fn private_room_between(&self, a: UserId, b: UserId) -> anyhow::Result<Room> {
		self.guarded("private_room_between", self.inner.private_room_between(a, b))
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::InMemoryStore;

	struct StalledStore;

	#[async_trait::async_trait]
	impl ChatStore for StalledStore {
		async fn user(&self, _id: UserId) -> anyhow::Result<Option<UserRecord>> {
			std::future::pending().await
		}
		async fn room_for_member(&self, _room: RoomId, _user: UserId) -> anyhow::Result<RoomAccess> {
			std::future::pending().await
		}
		async fn active_rooms_for_user(&self, _user: UserId) -> anyhow::Result<Vec<Room>> {
			std::future::pending().await
		}
		async fn create_message(
			&self,
			_room: RoomId,
			_sender: UserId,
			_content: &str,
			_kind: MessageKind,
		) -> anyhow::Result<StoredMessage> {
			std::future::pending().await
		}
		async fn create_attachment(
			&self,
			_message: &StoredMessage,
			_upload: NewAttachment<'_>,
		) -> anyhow::Result<StoredAttachment> {
			std::future::pending().await
		}
		async fn recent_messages(&self, _room: RoomId, _limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
			std::future::pending().await
		}
		async fn attachments_for(&self, _message: MessageId) -> anyhow::Result<Vec<StoredAttachment>> {
			std::future::pending().await
		}
		async fn upsert_presence(&self, _user: UserId, _status: PresenceStatus) -> anyhow::Result<PresenceRecord> {
			std::future::pending().await
		}
		async fn presence(&self, _user: UserId) -> anyhow::Result<Option<PresenceRecord>> {
			std::future::pending().await
		}
		async fn record_read(&self, _room: RoomId, _message: MessageId, _user: UserId) -> anyhow::Result<ReadOutcome> {
			std::future::pending().await
		}
		async fn unread_messages(&self, _room: RoomId, _user: UserId) -> anyhow::Result<Vec<MessageId>> {
			std::future::pending().await
		}
		async fn readers_of(&self, _message: MessageId) -> anyhow::Result<Vec<UserId>> {
			std::future::pending().await
		}
		async fn create_user(&self, _username: &str, _first: &str, _last: &str) -> anyhow::Result<UserRecord> {
			std::future::pending().await
		}
		async fn create_room(
			&self,
			_kind: RoomKind,
			_name: Option<&str>,
			_created_by: UserId,
			_participants: &[UserId],
		) -> anyhow::Result<Room> {
			std::future::pending().await
		}
		async fn private_room_between(&self, _a: UserId, _b: UserId) -> anyhow::Result<Room> {
			std::future::pending().await
		}
	}

	#[tokio::test]
	async fn stalled_calls_time_out() {
		let store = BoundedStore::new(
			Arc::new(StalledStore),
			BoundedStoreConfig {
				max_inflight: 1,
				call_timeout: Duration::from_millis(50),
			},
		);

		let err = store.user(UserId(1)).await.unwrap_err();
		assert!(err.to_string().contains("timed out"), "{err:#}");
	}

	#[tokio::test]
	async fn passes_results_through() {
		let store = BoundedStore::new(Arc::new(InMemoryStore::default()), BoundedStoreConfig::default());
		let user = store.create_user("alice", "", "").await.unwrap();
		assert_eq!(store.user(user.id).await.unwrap(), Some(user));
	}
}
