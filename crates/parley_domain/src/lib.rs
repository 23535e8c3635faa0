#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and enums from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid id: {0}")]
	InvalidId(String),
	#[error("unknown {kind}: {value}")]
	UnknownVariant { kind: &'static str, value: String },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub i64);

		impl $name {
			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<i64>()
					.ok()
					.filter(|v| *v > 0)
					.map(Self)
					.ok_or_else(|| ParseIdError::InvalidId(s.to_string()))
			}
		}

		impl From<i64> for $name {
			fn from(v: i64) -> Self {
				Self(v)
			}
		}
	};
}

numeric_id!(
	/// Storage-assigned user identifier.
	UserId
);
numeric_id!(
	/// Storage-assigned room identifier.
	RoomId
);
numeric_id!(
	/// Storage-assigned message identifier.
	MessageId
);

/// Process-local connection identifier. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Room kind. A private room has exactly two participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
	Private,
	Group,
}

impl RoomKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomKind::Private => "private",
			RoomKind::Group => "group",
		}
	}
}

impl fmt::Display for RoomKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"private" => Ok(RoomKind::Private),
			"group" => Ok(RoomKind::Group),
			other => Err(ParseIdError::UnknownVariant {
				kind: "room kind",
				value: other.to_string(),
			}),
		}
	}
}

/// Message kind as persisted and as reported in `message_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Text,
	File,
	Image,
	System,
}

impl MessageKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::File => "file",
			MessageKind::Image => "image",
			MessageKind::System => "system",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"text" => Ok(MessageKind::Text),
			"file" => Ok(MessageKind::File),
			"image" => Ok(MessageKind::Image),
			"system" => Ok(MessageKind::System),
			other => Err(ParseIdError::UnknownVariant {
				kind: "message kind",
				value: other.to_string(),
			}),
		}
	}
}

/// Coarse user presence. Last write wins across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
	Online,
	Away,
	Offline,
}

impl PresenceStatus {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			PresenceStatus::Online => "online",
			PresenceStatus::Away => "away",
			PresenceStatus::Offline => "offline",
		}
	}
}

impl fmt::Display for PresenceStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PresenceStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"online" => Ok(PresenceStatus::Online),
			"away" => Ok(PresenceStatus::Away),
			"offline" => Ok(PresenceStatus::Offline),
			other => Err(ParseIdError::UnknownVariant {
				kind: "presence status",
				value: other.to_string(),
			}),
		}
	}
}

/// Named fanout group on the bus.
///
/// Room groups are `chat_{roomId}`, personal groups are `user_{userId}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(String);

/// Parsed form of a [`GroupName`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupTarget {
	Room(RoomId),
	User(UserId),
}

impl GroupName {
	/// Prefix for room groups.
	pub const ROOM_PREFIX: &'static str = "chat_";
	/// Prefix for personal (per-user) groups.
	pub const USER_PREFIX: &'static str = "user_";

	/// Room group for `room`.
	pub fn room(room: RoomId) -> Self {
		Self(format!("{}{}", Self::ROOM_PREFIX, room))
	}

	/// Personal group for `user`.
	pub fn user(user: UserId) -> Self {
		Self(format!("{}{}", Self::USER_PREFIX, user))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Parse `chat_<id>` or `user_<id>`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		Self::target_of(s).map(|t| match t {
			GroupTarget::Room(room) => Self::room(room),
			GroupTarget::User(user) => Self::user(user),
		})
	}

	/// What this group addresses.
	pub fn target(&self) -> Option<GroupTarget> {
		Self::target_of(&self.0).ok()
	}

	fn target_of(s: &str) -> Result<GroupTarget, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(rest) = s.strip_prefix(Self::ROOM_PREFIX) {
			return Ok(GroupTarget::Room(rest.parse()?));
		}
		if let Some(rest) = s.strip_prefix(Self::USER_PREFIX) {
			return Ok(GroupTarget::User(rest.parse()?));
		}

		Err(ParseIdError::InvalidFormat("expected chat_<room> or user_<user>".into()))
	}
}

impl fmt::Display for GroupName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for GroupName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		GroupName::parse(s)
	}
}
