#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parley_domain::{MessageId, MessageKind, PresenceStatus, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Outbound events. Serialized as JSON objects tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	ChatMessage(MessageEvent),
	FileMessage(FileMessageEvent),
	UserStatus(UserStatusEvent),
	TypingIndicator(TypingEvent),
	UserUpdate(UserUpdateEvent),
	UserProfileUpdate(UserProfileEvent),
	ChatListUpdate(ChatListUpdateEvent),
	MessagesRead(MessagesReadEvent),
	Error(ErrorEvent),
}

/// Envelope shared by chat and file messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<MessageId>,
	pub room_id: RoomId,
	pub message: String,
	pub sender: String,
	pub sender_id: UserId,
	pub timestamp: DateTime<Utc>,
	pub message_type: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMessageEvent {
	#[serde(flatten)]
	pub envelope: MessageEvent,
	pub file_name: String,
	pub file_size: u64,
	pub file_type: String,
	pub file_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatusEvent {
	pub user_id: UserId,
	pub username: String,
	pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
	pub user_id: UserId,
	pub username: String,
	pub is_typing: bool,
}

/// Public profile fields carried by profile events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
	pub id: UserId,
	pub username: String,
	#[serde(default)]
	pub first_name: String,
	#[serde(default)]
	pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
	pub id: MessageId,
	pub content: String,
	pub timestamp: DateTime<Utc>,
	pub message_type: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserUpdateEvent {
	pub user: UserSummary,
	pub old_username: String,
	pub message: String,
	pub system_message: SystemMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfileEvent {
	pub user: UserSummary,
}

/// Room-list level notice: something happened in a room the recipient may not be viewing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatListUpdateEvent {
	pub room_id: RoomId,
	pub message_id: MessageId,
	pub sender: String,
	pub sender_id: UserId,
	pub preview: String,
	pub message_type: MessageKind,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesReadEvent {
	pub room_id: RoomId,
	pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
	pub message: String,
}

impl ServerEvent {
	/// Local `error` frame.
	pub fn error(message: impl Into<String>) -> Self {
		ServerEvent::Error(ErrorEvent {
			message: message.into(),
		})
	}

	/// Wire `type` of this event.
	pub fn event_type(&self) -> &'static str {
		match self {
			ServerEvent::ChatMessage(_) => "chat_message",
			ServerEvent::FileMessage(_) => "file_message",
			ServerEvent::UserStatus(_) => "user_status",
			ServerEvent::TypingIndicator(_) => "typing_indicator",
			ServerEvent::UserUpdate(_) => "user_update",
			ServerEvent::UserProfileUpdate(_) => "user_profile_update",
			ServerEvent::ChatListUpdate(_) => "chat_list_update",
			ServerEvent::MessagesRead(_) => "messages_read",
			ServerEvent::Error(_) => "error",
		}
	}

	/// Author of a typing indicator, used for self-suppression on delivery.
	pub fn typing_user(&self) -> Option<UserId> {
		match self {
			ServerEvent::TypingIndicator(t) => Some(t.user_id),
			_ => None,
		}
	}

	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn ts() -> DateTime<Utc> {
		DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc)
	}

	#[test]
	fn chat_message_wire_shape() {
		let ev = ServerEvent::ChatMessage(MessageEvent {
			message_id: Some(MessageId(5)),
			room_id: RoomId(42),
			message: "hi".to_string(),
			sender: "alice".to_string(),
			sender_id: UserId(1),
			timestamp: ts(),
			message_type: MessageKind::Text,
		});

		let v: serde_json::Value = serde_json::from_str(&ev.to_json().unwrap()).unwrap();
		assert_eq!(v["type"], "chat_message");
		assert_eq!(v["message_id"], 5);
		assert_eq!(v["sender"], "alice");
		assert_eq!(v["sender_id"], 1);
		assert_eq!(v["message_type"], "text");
		assert_eq!(v["timestamp"], "2024-05-01T12:00:00Z");
	}

	#[test]
	fn file_message_flattens_envelope() {
		let ev = ServerEvent::FileMessage(FileMessageEvent {
			envelope: MessageEvent {
				message_id: Some(MessageId(9)),
				room_id: RoomId(1),
				message: "Shared a file: a.pdf".to_string(),
				sender: "bob".to_string(),
				sender_id: UserId(2),
				timestamp: ts(),
				message_type: MessageKind::File,
			},
			file_name: "a.pdf".to_string(),
			file_size: 3,
			file_type: "application/pdf".to_string(),
			file_url: Some("/media/chat_files/1/a.pdf".to_string()),
		});

		let v: serde_json::Value = serde_json::from_str(&ev.to_json().unwrap()).unwrap();
		assert_eq!(v["type"], "file_message");
		assert_eq!(v["message_id"], 9);
		assert_eq!(v["file_size"], 3);
		assert_eq!(v["message_type"], "file");

		let back: ServerEvent = serde_json::from_value(v).unwrap();
		assert_eq!(back, ev);
	}

	#[test]
	fn error_and_presence_shapes() {
		let v = serde_json::to_value(ServerEvent::error("Invalid JSON format")).unwrap();
		assert_eq!(v, json!({"type": "error", "message": "Invalid JSON format"}));

		let v = serde_json::to_value(ServerEvent::UserStatus(UserStatusEvent {
			user_id: UserId(3),
			username: "carol".to_string(),
			status: PresenceStatus::Offline,
		}))
		.unwrap();
		assert_eq!(
			v,
			json!({"type": "user_status", "user_id": 3, "username": "carol", "status": "offline"})
		);
	}

	#[test]
	fn typing_user_only_for_typing_events() {
		let typing = ServerEvent::TypingIndicator(TypingEvent {
			user_id: UserId(4),
			username: "dan".to_string(),
			is_typing: true,
		});
		assert_eq!(typing.typing_user(), Some(UserId(4)));
		assert_eq!(ServerEvent::error("x").typing_user(), None);
	}
}
