#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{MessageId, RoomId, UserId};
use tracing::debug;

use crate::server::store::{ChatStore, ReadOutcome};

#[derive(Clone)]
pub struct ReadReceiptTracker {
	store: Arc<dyn ChatStore>,
}

impl ReadReceiptTracker {
	pub fn new(store: Arc<dyn ChatStore>) -> Self {
		Self { store }
	}

	/// Idempotent. Unknown or foreign-room messages are ignored.
	pub async fn mark_read(&self, room: RoomId, message: MessageId, user: UserId) -> anyhow::Result<ReadOutcome> {
		let outcome = self.store.record_read(room, message, user).await?;
		match outcome {
			ReadOutcome::Recorded => metrics::counter!("parley_server_read_receipts_total").increment(1),
			ReadOutcome::AlreadyRead => {}
			ReadOutcome::MessageNotFound => {
				debug!(room_id = %room, message_id = %message, user_id = %user, "receipts: message not in room")
			}
		}
		Ok(outcome)
	}

	/// Mark every message in `room` not sent by and not yet read by `user`.
	///
	/// Not atomic: on error the receipts recorded so far stay, and calling again resumes.
	pub async fn mark_room_read(&self, room: RoomId, user: UserId) -> anyhow::Result<u64> {
		let mut recorded = 0u64;
		for message in self.store.unread_messages(room, user).await? {
			if self.mark_read(room, message, user).await? == ReadOutcome::Recorded {
				recorded += 1;
			}
		}
		Ok(recorded)
	}
}
