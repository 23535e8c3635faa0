#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use parley_domain::{GroupName, MessageKind, UserId};
use parley_protocol::{ServerEvent, SystemMessage, UserProfileEvent, UserUpdateEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::group_bus::GroupBus;
use crate::server::store::{ChatStore, Room, UserRecord};

/// A profile change reported by the account layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileChange {
	UsernameChanged { user: UserRecord, old_username: String },
	ProfileUpdated { user: UserRecord },
}

/// Queue in front of the profile notifier task. Enqueueing never blocks and never fails the caller.
#[derive(Debug, Clone)]
pub struct ProfileFanout {
	tx: mpsc::UnboundedSender<ProfileChange>,
}

impl ProfileFanout {
	pub fn spawn(store: Arc<dyn ChatStore>, bus: Arc<dyn GroupBus>) -> (Self, JoinHandle<()>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let notifier = ProfileNotifier { store, bus };
		let task = tokio::spawn(notifier.run(rx));
		(Self { tx }, task)
	}

	/// `user` carries the new username.
	pub fn username_changed(&self, user: UserRecord, old_username: impl Into<String>) {
		self.enqueue(ProfileChange::UsernameChanged {
			user,
			old_username: old_username.into(),
		});
	}

	pub fn profile_updated(&self, user: UserRecord) {
		self.enqueue(ProfileChange::ProfileUpdated { user });
	}

	fn enqueue(&self, change: ProfileChange) {
		if self.tx.send(change).is_err() {
			warn!("profile fanout: notifier is gone; change dropped");
		}
	}
}

struct ProfileNotifier {
	store: Arc<dyn ChatStore>,
	bus: Arc<dyn GroupBus>,
}

impl ProfileNotifier {
	async fn run(self, mut rx: mpsc::UnboundedReceiver<ProfileChange>) {
		while let Some(change) = rx.recv().await {
			if let Err(e) = self.apply(&change).await {
				metrics::counter!("parley_server_profile_fanout_errors_total").increment(1);
				warn!(error = %format!("{e:#}"), "profile fanout: change not delivered");
			}
		}
		debug!("profile fanout: queue closed");
	}

	async fn apply(&self, change: &ProfileChange) -> anyhow::Result<()> {
		match change {
			ProfileChange::UsernameChanged { user, old_username } => {
				let rooms = self.store.active_rooms_for_user(user.id).await?;
				for room in &rooms {
					self.announce_rename(room, user, old_username).await;
				}
				self.notify_chat_lists(user, &rooms).await;
			}
			ProfileChange::ProfileUpdated { user } => {
				let rooms = self.store.active_rooms_for_user(user.id).await?;
				self.notify_chat_lists(user, &rooms).await;
			}
		}
		Ok(())
	}

	// A failed room is logged and skipped so the remaining rooms still hear about it.
	async fn announce_rename(&self, room: &Room, user: &UserRecord, old_username: &str) {
		let text = format!("{old_username} is now known as {}", user.username);
		let msg = match self
			.store
			.create_message(room.id, user.id, &text, MessageKind::System)
			.await
		{
			Ok(m) => m,
			Err(e) => {
				warn!(room_id = %room.id, user_id = %user.id, error = %format!("{e:#}"), "profile fanout: system message not stored");
				return;
			}
		};

		let event = ServerEvent::UserUpdate(UserUpdateEvent {
			user: user.summary(),
			old_username: old_username.to_string(),
			message: text,
			system_message: SystemMessage {
				id: msg.id,
				content: msg.content.clone(),
				timestamp: msg.created_at,
				message_type: msg.kind,
			},
		});
		self.bus.publish(&GroupName::room(room.id), event).await;
	}

	async fn notify_chat_lists(&self, user: &UserRecord, rooms: &[Room]) {
		let mut audience: BTreeSet<UserId> = rooms.iter().flat_map(|r| r.participants.iter().copied()).collect();
		audience.insert(user.id);

		let event = ServerEvent::UserProfileUpdate(UserProfileEvent { user: user.summary() });
		for member in audience {
			self.bus.publish(&GroupName::user(member), event.clone()).await;
		}
	}
}
