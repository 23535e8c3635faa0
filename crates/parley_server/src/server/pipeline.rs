#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parley_domain::{GroupName, MessageKind};
use parley_protocol::limits::{MAX_FILE_BYTES, extension_of};
use parley_protocol::{ChatListUpdateEvent, FileMessageEvent, FileUpload, MessageEvent, ServerEvent};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::group_bus::GroupBus;
use crate::server::session::SessionContext;
use crate::server::store::{ChatStore, NewAttachment, RoomAccess, StoredAttachment, StoredMessage};

const PREVIEW_CHARS: usize = 100;

/// Validation and persistence failures. The `Display` text is sent to the client as an `error` frame.
#[derive(Debug, Error)]
pub enum PipelineError {
	#[error("Message content cannot be empty")]
	EmptyContent,

	#[error("File size exceeds 10MB limit")]
	FileTooLarge { size: usize },

	#[error("File type not allowed: .{0}")]
	DisallowedExtension(String),

	#[error("File type not allowed")]
	MissingExtension,

	#[error("Invalid file data")]
	InvalidFileData(#[source] base64::DecodeError),

	#[error("Failed to save message: {0:#}")]
	Persistence(anyhow::Error),

	#[error("Error processing file: {0:#}")]
	FilePersistence(anyhow::Error),
}

impl PipelineError {
	pub fn kind(&self) -> &'static str {
		match self {
			PipelineError::EmptyContent => "empty_content",
			PipelineError::FileTooLarge { .. } => "file_too_large",
			PipelineError::DisallowedExtension(_) | PipelineError::MissingExtension => "file_type",
			PipelineError::InvalidFileData(_) => "invalid_file_data",
			PipelineError::Persistence(_) => "persistence",
			PipelineError::FilePersistence(_) => "file_persistence",
		}
	}
}

/// Upload rules applied before storage is touched.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
	allowed_extensions: Arc<HashSet<String>>,
	max_file_bytes: usize,
}

impl UploadPolicy {
	pub fn new<I, S>(allowed_extensions: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		Self {
			allowed_extensions: Arc::new(
				allowed_extensions
					.into_iter()
					.map(|s| s.as_ref().trim_start_matches('.').to_ascii_lowercase())
					.collect(),
			),
			max_file_bytes: MAX_FILE_BYTES,
		}
	}

	pub fn max_file_bytes(&self) -> usize {
		self.max_file_bytes
	}

	fn check_name(&self, file_name: &str) -> Result<(), PipelineError> {
		let ext = extension_of(file_name).ok_or(PipelineError::MissingExtension)?;
		if self.allowed_extensions.contains(&ext) {
			Ok(())
		} else {
			Err(PipelineError::DisallowedExtension(ext))
		}
	}

	fn decode(&self, file_data: &str) -> Result<Vec<u8>, PipelineError> {
		let data = file_data.trim();
		// Tolerate `data:<mime>;base64,` prefixes from browser FileReader output.
		let data = match data.split_once(";base64,") {
			Some((prefix, rest)) if prefix.starts_with("data:") => rest,
			_ => data,
		};

		let bytes = STANDARD.decode(data).map_err(PipelineError::InvalidFileData)?;
		if bytes.len() > self.max_file_bytes {
			return Err(PipelineError::FileTooLarge { size: bytes.len() });
		}
		Ok(bytes)
	}
}

impl Default for UploadPolicy {
	fn default() -> Self {
		Self::new(parley_protocol::limits::DEFAULT_ALLOWED_EXTENSIONS)
	}
}

/// Validates, persists and republishes chat and file messages.
#[derive(Clone)]
pub struct MessagePipeline {
	store: Arc<dyn ChatStore>,
	bus: Arc<dyn GroupBus>,
	uploads: UploadPolicy,
}

impl MessagePipeline {
	pub fn new(store: Arc<dyn ChatStore>, bus: Arc<dyn GroupBus>, uploads: UploadPolicy) -> Self {
		Self { store, bus, uploads }
	}

	pub async fn send_text(&self, ctx: &SessionContext, content: &str) -> Result<StoredMessage, PipelineError> {
		if content.trim().is_empty() {
			return Err(PipelineError::EmptyContent);
		}

		let msg = self
			.store
			.create_message(ctx.room.id, ctx.user.id, content, MessageKind::Text)
			.await
			.map_err(PipelineError::Persistence)?;

		self.bus
			.publish(&ctx.room_group, ServerEvent::ChatMessage(self.envelope(ctx, &msg)))
			.await;
		metrics::counter!("parley_server_messages_total", "kind" => "text").increment(1);

		self.notify_chat_lists(ctx, &msg).await;
		Ok(msg)
	}

	/// Order: extension, decode, size, then message row, then attachment row.
	pub async fn send_file(
		&self,
		ctx: &SessionContext,
		upload: &FileUpload,
	) -> Result<(StoredMessage, StoredAttachment), PipelineError> {
		self.uploads.check_name(&upload.file_name)?;
		let bytes = self.uploads.decode(&upload.file_data)?;

		let content = format!("Shared a file: {}", upload.file_name);
		let msg = self
			.store
			.create_message(ctx.room.id, ctx.user.id, &content, MessageKind::File)
			.await
			.map_err(PipelineError::FilePersistence)?;

		let attachment = match self
			.store
			.create_attachment(
				&msg,
				NewAttachment {
					bytes: &bytes,
					file_name: &upload.file_name,
					file_type: &upload.file_type,
				},
			)
			.await
		{
			Ok(a) => a,
			Err(e) => {
				// The message row stays without an attachment; nothing is published for it.
				warn!(
					conn_id = %ctx.conn_id,
					message_id = %msg.id,
					error = %format!("{e:#}"),
					"pipeline: attachment write failed after message was stored"
				);
				return Err(PipelineError::FilePersistence(e));
			}
		};

		let event = FileMessageEvent {
			envelope: self.envelope(ctx, &msg),
			file_name: attachment.file_name.clone(),
			file_size: attachment.file_size,
			file_type: attachment.file_type.clone(),
			file_url: Some(attachment.file_url.clone()),
		};
		self.bus.publish(&ctx.room_group, ServerEvent::FileMessage(event)).await;
		metrics::counter!("parley_server_messages_total", "kind" => "file").increment(1);

		self.notify_chat_lists(ctx, &msg).await;
		Ok((msg, attachment))
	}

	fn envelope(&self, ctx: &SessionContext, msg: &StoredMessage) -> MessageEvent {
		MessageEvent {
			message_id: Some(msg.id),
			room_id: msg.room_id,
			message: msg.content.clone(),
			sender: ctx.user.username.clone(),
			sender_id: ctx.user.id,
			timestamp: msg.created_at,
			message_type: msg.kind,
		}
	}

	async fn notify_chat_lists(&self, ctx: &SessionContext, msg: &StoredMessage) {
		let event = ChatListUpdateEvent {
			room_id: msg.room_id,
			message_id: msg.id,
			sender: ctx.user.username.clone(),
			sender_id: ctx.user.id,
			preview: preview(&msg.content),
			message_type: msg.kind,
			timestamp: msg.created_at,
		};

		// Membership can change while the session is open, so recipients come from storage.
		let participants = match self.store.room_for_member(ctx.room.id, ctx.user.id).await {
			Ok(RoomAccess::Granted(room)) => room.participants,
			Ok(access) => {
				debug!(conn_id = %ctx.conn_id, ?access, "pipeline: room no longer accessible; using join-time participants");
				ctx.room.participants.clone()
			}
			Err(e) => {
				warn!(conn_id = %ctx.conn_id, error = %format!("{e:#}"), "pipeline: participant lookup failed; using join-time participants");
				ctx.room.participants.clone()
			}
		};

		for participant in participants.iter().filter(|p| **p != ctx.user.id) {
			let group = GroupName::user(*participant);
			let report = self.bus.publish(&group, ServerEvent::ChatListUpdate(event.clone())).await;
			debug!(group = %group, delivered = report.delivered, "pipeline: chat list notified");
		}
	}
}

fn preview(content: &str) -> String {
	let mut chars = content.chars();
	let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
	if chars.next().is_some() { format!("{head}…") } else { head }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preview_truncates_long_content() {
		assert_eq!(preview("hi"), "hi");
		let long = "x".repeat(150);
		let p = preview(&long);
		assert_eq!(p.chars().count(), PREVIEW_CHARS + 1);
		assert!(p.ends_with('…'));
	}

	#[test]
	fn policy_checks_extension_case_insensitively() {
		let policy = UploadPolicy::new(["pdf", ".PNG"]);
		assert!(policy.check_name("Report.PDF").is_ok());
		assert!(policy.check_name("a.png").is_ok());
		assert!(matches!(
			policy.check_name("run.exe"),
			Err(PipelineError::DisallowedExtension(ext)) if ext == "exe"
		));
		assert!(matches!(policy.check_name("README"), Err(PipelineError::MissingExtension)));
	}

	#[test]
	fn decode_accepts_data_urls_and_rejects_junk() {
		let policy = UploadPolicy::default();
		assert_eq!(policy.decode("aGk=").unwrap(), b"hi");
		assert_eq!(policy.decode("data:text/plain;base64,aGk=").unwrap(), b"hi");

		let err = policy.decode("not base64!").unwrap_err();
		assert_eq!(err.to_string(), "Invalid file data");
	}
}
