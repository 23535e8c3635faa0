#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{GroupName, PresenceStatus, UserId};
use parley_protocol::{ServerEvent, UserStatusEvent};
use tokio::sync::RwLock;
use tracing::warn;

use crate::server::group_bus::GroupBus;
use crate::server::store::{ChatStore, UserRecord};

/// Last known status per user. Last write wins across a user's connections.
#[derive(Clone)]
pub struct PresenceTracker {
	store: Arc<dyn ChatStore>,
	bus: Arc<dyn GroupBus>,
	view: Arc<RwLock<HashMap<UserId, PresenceStatus>>>,
}

impl PresenceTracker {
	pub fn new(store: Arc<dyn ChatStore>, bus: Arc<dyn GroupBus>) -> Self {
		Self {
			store,
			bus,
			view: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	/// Record `status` for `user`, then announce it to `group`.
	///
	/// A storage failure is logged; the announcement still goes out so peers see the transition.
	pub async fn transition(&self, user: &UserRecord, group: &GroupName, status: PresenceStatus) {
		let online = {
			let mut view = self.view.write().await;
			view.insert(user.id, status);
			view.values().filter(|s| **s == PresenceStatus::Online).count()
		};
		metrics::gauge!("parley_server_users_online").set(online as f64);

		if let Err(e) = self.store.upsert_presence(user.id, status).await {
			warn!(
				user_id = %user.id,
				status = %status,
				error = %format!("{e:#}"),
				"presence: upsert failed"
			);
		}

		self.bus.publish(group, status_event(user, status)).await;
		metrics::counter!("parley_server_presence_transitions_total", "status" => status.as_str()).increment(1);
	}
}

pub fn status_event(user: &UserRecord, status: PresenceStatus) -> ServerEvent {
	ServerEvent::UserStatus(UserStatusEvent {
		user_id: user.id,
		username: user.username.clone(),
		status,
	})
}
