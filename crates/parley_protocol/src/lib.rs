#![forbid(unsafe_code)]

pub mod events;
pub mod frames;

pub use events::{
	ChatListUpdateEvent, ErrorEvent, FileMessageEvent, MessageEvent, MessagesReadEvent, ServerEvent, SystemMessage,
	TypingEvent, UserProfileEvent, UserStatusEvent, UserSummary, UserUpdateEvent,
};
pub use frames::{ClientFrame, FileUpload, ProtocolError, decode_client_frame};

/// Default maximum inbound text frame size.
///
/// A 10 MiB file grows by a third once base64 encoded, so the frame limit sits above that.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Default WebSocket message cap. Frames between the two limits still get an `error` reply.
pub const DEFAULT_MAX_TRANSPORT_SIZE: usize = 64 * 1024 * 1024; // 64 MiB

/// Upload limits enforced at the protocol boundary.
pub mod limits {
	/// Largest accepted decoded file payload.
	pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

	/// MIME type used when a client omits `file_type`.
	pub const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

	/// Attachment extensions accepted by default (documents, images, audio, video, archives).
	pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
		"pdf", "doc", "docx", "txt", "jpg", "jpeg", "png", "gif", "mp4", "mp3", "zip", "rar",
	];

	/// Lowercased extension of `file_name`, if it has one.
	pub fn extension_of(file_name: &str) -> Option<String> {
		let (stem, ext) = file_name.trim().rsplit_once('.')?;
		if stem.is_empty() || ext.is_empty() {
			return None;
		}
		Some(ext.to_ascii_lowercase())
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn extension_is_lowercased() {
			assert_eq!(extension_of("Report.PDF").as_deref(), Some("pdf"));
			assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
		}

		#[test]
		fn dotfiles_and_bare_names_have_no_extension() {
			assert_eq!(extension_of(".bashrc"), None);
			assert_eq!(extension_of("README"), None);
			assert_eq!(extension_of("trailing."), None);
		}
	}
}
