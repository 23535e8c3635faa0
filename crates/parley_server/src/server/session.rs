#![forbid(unsafe_code)]

//! Per-connection session state machines.
//!
//! A room-bound [`ChatSession`] goes `Connecting -> Authenticated -> Joined -> Closed`. Everything it
//! needs after the join lives in an immutable [`SessionContext`].

use std::sync::atomic::{AtomicBool, Ordering};

use parley_domain::{ConnId, GroupName, PresenceStatus, RoomId, UserId};
use parley_protocol::{ClientFrame, MessagesReadEvent, ServerEvent, TypingEvent, decode_client_frame};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::server::group_bus::ConnectionHandle;
use crate::server::state::ServerState;
use crate::server::store::{Room, RoomAccess, UserRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Authenticated,
	Joined,
	Closed,
}

/// Fixed at `Connecting -> Joined` and passed to every handler.
#[derive(Debug, Clone)]
pub struct SessionContext {
	pub conn_id: ConnId,
	pub user: UserRecord,
	pub room: Room,
	pub room_group: GroupName,
	pub personal_group: GroupName,
}

/// Why a connection never reached `Joined`. No group has been joined when this is returned.
#[derive(Debug, Error)]
pub enum RejectReason {
	#[error("authentication required")]
	Unauthenticated,

	#[error("room {0} not found")]
	RoomNotFound(RoomId),

	#[error("user {user} is not a participant of room {room}")]
	Forbidden { room: RoomId, user: UserId },

	#[error("room lookup failed")]
	Lookup(#[source] anyhow::Error),
}

impl RejectReason {
	pub fn kind(&self) -> &'static str {
		match self {
			RejectReason::Unauthenticated => "unauthenticated",
			RejectReason::RoomNotFound(_) => "room_not_found",
			RejectReason::Forbidden { .. } => "forbidden",
			RejectReason::Lookup(_) => "lookup",
		}
	}
}

/// What the transport needs from a joined session.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
	fn conn_id(&self) -> ConnId;

	/// Delivery filter applied before an event is written to this connection's socket.
	fn accepts(&self, event: &ServerEvent) -> bool;

	async fn handle_text(&self, text: &str);

	/// Idempotent.
	async fn close(&self);
}

/// Room-bound session.
pub struct ChatSession {
	ctx: SessionContext,
	handle: ConnectionHandle,
	state: ServerState,
	closed: AtomicBool,
}

impl ChatSession {
	pub async fn open(
		state: &ServerState,
		handle: ConnectionHandle,
		room_id: RoomId,
		token: Option<&str>,
	) -> Result<Self, RejectReason> {
		let conn_id = handle.id();

		let user = state
			.auth
			.authenticate(token)
			.await
			.into_user()
			.ok_or(RejectReason::Unauthenticated)?;
		debug!(%conn_id, user_id = %user.id, state = ?SessionState::Authenticated, "session: authenticated");

		let room = match state
			.store
			.room_for_member(room_id, user.id)
			.await
			.map_err(RejectReason::Lookup)?
		{
			RoomAccess::Granted(room) => room,
			RoomAccess::NotFound => return Err(RejectReason::RoomNotFound(room_id)),
			RoomAccess::Forbidden => {
				return Err(RejectReason::Forbidden {
					room: room_id,
					user: user.id,
				});
			}
		};

		let ctx = SessionContext {
			conn_id,
			room_group: GroupName::room(room.id),
			personal_group: GroupName::user(user.id),
			user,
			room,
		};

		state.bus.join(&ctx.room_group, &handle).await;
		state.bus.join(&ctx.personal_group, &handle).await;
		state
			.presence
			.transition(&ctx.user, &ctx.room_group, PresenceStatus::Online)
			.await;

		info!(
			%conn_id,
			user_id = %ctx.user.id,
			room_id = %ctx.room.id,
			state = ?SessionState::Joined,
			"session: joined"
		);

		Ok(Self {
			ctx,
			handle,
			state: state.clone(),
			closed: AtomicBool::new(false),
		})
	}

	pub fn context(&self) -> &SessionContext {
		&self.ctx
	}

	pub fn state(&self) -> SessionState {
		if self.closed.load(Ordering::Acquire) {
			SessionState::Closed
		} else {
			SessionState::Joined
		}
	}

	fn reply(&self, event: ServerEvent) {
		let event_type = event.event_type();
		if !self.handle.send_local(event) {
			debug!(conn_id = %self.ctx.conn_id, event_type, "session: local reply dropped (queue full or closed)");
		}
	}

	fn reply_error(&self, kind: &'static str, message: String) {
		metrics::counter!("parley_server_session_errors_total", "kind" => kind).increment(1);
		self.reply(ServerEvent::error(message));
	}

	async fn dispatch(&self, frame: ClientFrame) {
		match frame {
			ClientFrame::ChatMessage { message } => {
				if let Err(e) = self.state.pipeline.send_text(&self.ctx, &message).await {
					self.reply_error(e.kind(), e.to_string());
				}
			}
			ClientFrame::FileMessage(upload) => {
				if let Err(e) = self.state.pipeline.send_file(&self.ctx, &upload).await {
					self.reply_error(e.kind(), e.to_string());
				}
			}
			ClientFrame::TypingStart => self.typing(true).await,
			ClientFrame::TypingStop => self.typing(false).await,
			ClientFrame::MarkRead { message_id } => {
				if let Err(e) = self
					.state
					.receipts
					.mark_read(self.ctx.room.id, message_id, self.ctx.user.id)
					.await
				{
					warn!(conn_id = %self.ctx.conn_id, message_id = %message_id, error = %format!("{e:#}"), "session: mark_read failed");
					self.reply_error("persistence", format!("Failed to mark message as read: {e:#}"));
				}
			}
			ClientFrame::MarkRoomRead => {
				match self
					.state
					.receipts
					.mark_room_read(self.ctx.room.id, self.ctx.user.id)
					.await
				{
					Ok(count) => self.reply(ServerEvent::MessagesRead(MessagesReadEvent {
						room_id: self.ctx.room.id,
						count,
					})),
					Err(e) => {
						warn!(conn_id = %self.ctx.conn_id, error = %format!("{e:#}"), "session: mark_room_read failed");
						self.reply_error("persistence", format!("Failed to mark messages as read: {e:#}"));
					}
				}
			}
		}
	}

	async fn typing(&self, is_typing: bool) {
		let event = ServerEvent::TypingIndicator(TypingEvent {
			user_id: self.ctx.user.id,
			username: self.ctx.user.username.clone(),
			is_typing,
		});
		self.state.bus.publish(&self.ctx.room_group, event).await;
	}
}

#[async_trait::async_trait]
impl Session for ChatSession {
	fn conn_id(&self) -> ConnId {
		self.ctx.conn_id
	}

	fn accepts(&self, event: &ServerEvent) -> bool {
		match event {
			// Only the chat-list session renders room-list notices.
			ServerEvent::ChatListUpdate(_) => false,
			other => other.typing_user() != Some(self.ctx.user.id),
		}
	}

	async fn handle_text(&self, text: &str) {
		if self.closed.load(Ordering::Acquire) {
			return;
		}

		match decode_client_frame(text, self.state.limits.max_frame_bytes) {
			Ok(frame) => {
				metrics::counter!("parley_server_frames_in_total", "type" => frame.frame_type()).increment(1);
				self.dispatch(frame).await;
			}
			Err(e) => {
				debug!(conn_id = %self.ctx.conn_id, error = %e, "session: undecodable frame");
				self.reply_error(e.kind(), e.to_string());
			}
		}
	}

	async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		self.state
			.presence
			.transition(&self.ctx.user, &self.ctx.room_group, PresenceStatus::Offline)
			.await;
		let left = self.state.bus.leave_all(self.ctx.conn_id).await;

		info!(
			conn_id = %self.ctx.conn_id,
			user_id = %self.ctx.user.id,
			room_id = %self.ctx.room.id,
			groups = left.len(),
			state = ?SessionState::Closed,
			"session: closed"
		);
	}
}
