use parley_domain::MessageId;
use parley_protocol::{ClientFrame, DEFAULT_MAX_FRAME_SIZE, ProtocolError, decode_client_frame};
use proptest::prelude::*;
use serde_json::json;

fn decode(v: serde_json::Value) -> Result<ClientFrame, ProtocolError> {
	decode_client_frame(&v.to_string(), DEFAULT_MAX_FRAME_SIZE)
}

#[test]
fn typing_frames_need_no_payload() {
	assert_eq!(decode(json!({"type": "typing_start"})).unwrap(), ClientFrame::TypingStart);
	assert_eq!(decode(json!({"type": "typing_stop"})).unwrap(), ClientFrame::TypingStop);
}

#[test]
fn mark_read_accepts_numeric_id() {
	assert_eq!(
		decode(json!({"type": "mark_read", "message_id": 77})).unwrap(),
		ClientFrame::MarkRead {
			message_id: MessageId(77)
		}
	);
}

#[test]
fn mark_read_rejects_non_positive_id() {
	let err = decode(json!({"type": "mark_read", "message_id": 0})).unwrap_err();
	assert!(matches!(err, ProtocolError::InvalidField { field: "message_id", .. }));
}

#[test]
fn malformed_json_has_stable_message() {
	let err = decode_client_frame("{\"type\": \"chat_message\"", DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, ProtocolError::MalformedJson(_)));
	assert_eq!(err.to_string(), "Invalid JSON format");
}

#[test]
fn unknown_type_is_reported_by_name() {
	let err = decode(json!({"type": "shout", "message": "x"})).unwrap_err();
	assert_eq!(err.to_string(), "Unknown message type: shout");
	assert_eq!(err.kind(), "unknown_type");
}

#[test]
fn missing_type_and_fields_are_named() {
	let err = decode(json!({"message": "x"})).unwrap_err();
	assert!(matches!(err, ProtocolError::MissingField("type")));

	let err = decode(json!({"type": "chat_message"})).unwrap_err();
	assert_eq!(err.to_string(), "Missing field: message");

	let err = decode(json!({"type": "file_message", "file_data": "aGk="})).unwrap_err();
	assert!(matches!(err, ProtocolError::MissingField("file_name")));
}

#[test]
fn non_object_json_is_missing_type() {
	let err = decode(json!(["chat_message"])).unwrap_err();
	assert!(matches!(err, ProtocolError::MissingField("type")));
}

#[test]
fn wrongly_typed_field_is_invalid() {
	let err = decode(json!({"type": "chat_message", "message": 12})).unwrap_err();
	assert!(matches!(
		err,
		ProtocolError::InvalidField {
			field: "message",
			expected: "string"
		}
	));
}

proptest! {
	#[test]
	fn chat_message_content_is_preserved(content in ".*") {
		let frame = decode(json!({"type": "chat_message", "message": content.clone()})).unwrap();
		prop_assert_eq!(frame, ClientFrame::ChatMessage { message: content });
	}

	#[test]
	fn arbitrary_text_never_panics(text in ".{0,256}") {
		let _ = decode_client_frame(&text, DEFAULT_MAX_FRAME_SIZE);
	}
}
