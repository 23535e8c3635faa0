#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use parley_domain::{ConnId, GroupName};
use parley_protocol::ServerEvent;
use tracing::{debug, info};

use crate::server::group_bus::ConnectionHandle;
use crate::server::session::{RejectReason, Session};
use crate::server::state::ServerState;
use crate::server::store::UserRecord;

/// Room-independent session bound to the user's personal group.
pub struct ChatListSession {
	conn_id: ConnId,
	user: UserRecord,
	group: GroupName,
	state: ServerState,
	closed: AtomicBool,
}

impl ChatListSession {
	pub async fn open(state: &ServerState, handle: ConnectionHandle, token: Option<&str>) -> Result<Self, RejectReason> {
		let user = state
			.auth
			.authenticate(token)
			.await
			.into_user()
			.ok_or(RejectReason::Unauthenticated)?;

		let group = GroupName::user(user.id);
		state.bus.join(&group, &handle).await;
		info!(conn_id = %handle.id(), user_id = %user.id, group = %group, "chat list: joined");

		Ok(Self {
			conn_id: handle.id(),
			user,
			group,
			state: state.clone(),
			closed: AtomicBool::new(false),
		})
	}

	pub fn group(&self) -> &GroupName {
		&self.group
	}
}

#[async_trait::async_trait]
impl Session for ChatListSession {
	fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	fn accepts(&self, event: &ServerEvent) -> bool {
		matches!(event, ServerEvent::ChatListUpdate(_) | ServerEvent::UserProfileUpdate(_))
	}

	async fn handle_text(&self, text: &str) {
		debug!(conn_id = %self.conn_id, len = text.len(), "chat list: inbound frame ignored");
	}

	async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.state.bus.leave(&self.group, self.conn_id).await;
		info!(conn_id = %self.conn_id, user_id = %self.user.id, "chat list: closed");
	}
}
