#![forbid(unsafe_code)]

use parley_domain::MessageId;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::limits::DEFAULT_FILE_TYPE;

/// Inbound frame decode failures. The `Display` text is what the client sees in its `error` frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("Frame exceeds maximum size ({len} > {max} bytes)")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	/// An oversized frame that declares itself a `file_message`. Same wording as the decoded-size check.
	#[error("File size exceeds 10MB limit")]
	FileTooLarge {
		len: usize,
		max: usize,
	},

	#[error("Invalid JSON format")]
	MalformedJson(#[source] serde_json::Error),

	#[error("Missing field: {0}")]
	MissingField(&'static str),

	#[error("Invalid field {field}: expected {expected}")]
	InvalidField {
		field: &'static str,
		expected: &'static str,
	},

	#[error("Unknown message type: {0}")]
	UnknownType(String),

	#[error("Binary frames are not supported")]
	BinaryFrame,
}

impl ProtocolError {
	/// Short label for metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			ProtocolError::FrameTooLarge { .. } => "frame_too_large",
			ProtocolError::FileTooLarge { .. } => "file_too_large",
			ProtocolError::MalformedJson(_) => "malformed_json",
			ProtocolError::MissingField(_) => "missing_field",
			ProtocolError::InvalidField { .. } => "invalid_field",
			ProtocolError::UnknownType(_) => "unknown_type",
			ProtocolError::BinaryFrame => "binary_frame",
		}
	}
}

/// Base64 file upload as sent by the client. Not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
	pub file_data: String,
	pub file_name: String,
	pub file_type: String,
}

/// Inbound frames, keyed by their declared `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
	ChatMessage { message: String },
	FileMessage(FileUpload),
	TypingStart,
	TypingStop,
	MarkRead { message_id: MessageId },
	MarkRoomRead,
}

impl ClientFrame {
	/// Declared wire type.
	pub fn frame_type(&self) -> &'static str {
		match self {
			ClientFrame::ChatMessage { .. } => "chat_message",
			ClientFrame::FileMessage(_) => "file_message",
			ClientFrame::TypingStart => "typing_start",
			ClientFrame::TypingStop => "typing_stop",
			ClientFrame::MarkRead { .. } => "mark_read",
			ClientFrame::MarkRoomRead => "mark_room_read",
		}
	}
}

/// Decode one inbound text frame.
pub fn decode_client_frame(text: &str, max_frame_size: usize) -> Result<ClientFrame, ProtocolError> {
	if text.len() > max_frame_size {
		let (len, max) = (text.len(), max_frame_size);
		return Err(match declared_type(text).as_deref() {
			Some("file_message") => ProtocolError::FileTooLarge { len, max },
			_ => ProtocolError::FrameTooLarge { len, max },
		});
	}

	let value: Value = serde_json::from_str(text).map_err(ProtocolError::MalformedJson)?;
	let frame_type = value.str_field("type")?;

	match frame_type {
		"chat_message" => Ok(ClientFrame::ChatMessage {
			message: value.str_field("message")?.to_string(),
		}),
		"file_message" => Ok(ClientFrame::FileMessage(FileUpload {
			file_data: value.str_field("file_data")?.to_string(),
			file_name: value.str_field("file_name")?.to_string(),
			file_type: value
				.opt_str_field("file_type")?
				.filter(|t| !t.trim().is_empty())
				.unwrap_or(DEFAULT_FILE_TYPE)
				.to_string(),
		})),
		"typing_start" => Ok(ClientFrame::TypingStart),
		"typing_stop" => Ok(ClientFrame::TypingStop),
		"mark_read" => Ok(ClientFrame::MarkRead {
			message_id: value.message_id_field("message_id")?,
		}),
		"mark_room_read" => Ok(ClientFrame::MarkRoomRead),
		other => Err(ProtocolError::UnknownType(other.to_string())),
	}
}

#[derive(Deserialize)]
struct TypeOnly {
	#[serde(rename = "type")]
	frame_type: Option<String>,
}

// Only `type` is kept; every other value is skipped without being buffered.
fn declared_type(text: &str) -> Option<String> {
	serde_json::from_str::<TypeOnly>(text).ok()?.frame_type
}

trait GetField {
	fn str_field(&self, field: &'static str) -> Result<&str, ProtocolError>;
	fn opt_str_field(&self, field: &'static str) -> Result<Option<&str>, ProtocolError>;
	fn message_id_field(&self, field: &'static str) -> Result<MessageId, ProtocolError>;
}

impl GetField for Value {
	fn str_field(&self, field: &'static str) -> Result<&str, ProtocolError> {
		self.opt_str_field(field)?.ok_or(ProtocolError::MissingField(field))
	}

	fn opt_str_field(&self, field: &'static str) -> Result<Option<&str>, ProtocolError> {
		match self.get(field) {
			None | Some(Value::Null) => Ok(None),
			Some(Value::String(s)) => Ok(Some(s.as_str())),
			Some(_) => Err(ProtocolError::InvalidField {
				field,
				expected: "string",
			}),
		}
	}

	// Clients send ids both as numbers and as numeric strings.
	fn message_id_field(&self, field: &'static str) -> Result<MessageId, ProtocolError> {
		let invalid = ProtocolError::InvalidField {
			field,
			expected: "positive integer id",
		};

		match self.get(field) {
			None | Some(Value::Null) => Err(ProtocolError::MissingField(field)),
			Some(Value::Number(n)) => n.as_i64().filter(|v| *v > 0).map(MessageId).ok_or(invalid),
			Some(Value::String(s)) => s.parse::<MessageId>().map_err(|_| invalid),
			Some(_) => Err(invalid),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::DEFAULT_MAX_FRAME_SIZE;

	#[test]
	fn decodes_chat_message() {
		let frame = decode_client_frame(r#"{"type":"chat_message","message":"hi"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap();
		assert_eq!(
			frame,
			ClientFrame::ChatMessage {
				message: "hi".to_string()
			}
		);
	}

	#[test]
	fn file_type_defaults_when_missing() {
		let frame = decode_client_frame(
			r#"{"type":"file_message","file_data":"aGk=","file_name":"a.txt"}"#,
			DEFAULT_MAX_FRAME_SIZE,
		)
		.unwrap();

		match frame {
			ClientFrame::FileMessage(upload) => assert_eq!(upload.file_type, "application/octet-stream"),
			other => panic!("expected FileMessage, got {other:?}"),
		}
	}

	#[test]
	fn mark_read_accepts_string_ids() {
		let frame = decode_client_frame(r#"{"type":"mark_read","message_id":"12"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap();
		assert_eq!(
			frame,
			ClientFrame::MarkRead {
				message_id: MessageId(12)
			}
		);
	}

	#[test]
	fn oversized_frame_is_rejected_before_parsing() {
		let err = decode_client_frame("{not json at all}", 4).unwrap_err();
		assert!(matches!(err, ProtocolError::FrameTooLarge { len: 17, max: 4 }));
	}

	#[test]
	fn oversized_file_message_reports_file_size() {
		let frame = format!(
			r#"{{"type":"file_message","file_name":"big.zip","file_data":"{}"}}"#,
			"A".repeat(64)
		);
		let err = decode_client_frame(&frame, 32).unwrap_err();
		assert!(matches!(err, ProtocolError::FileTooLarge { max: 32, .. }));
		assert_eq!(err.to_string(), "File size exceeds 10MB limit");

		let chat = format!(r#"{{"type":"chat_message","message":"{}"}}"#, "A".repeat(64));
		assert!(matches!(
			decode_client_frame(&chat, 32).unwrap_err(),
			ProtocolError::FrameTooLarge { .. }
		));
	}
}
