#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use parley_domain::ConnId;

use crate::config::ServerConfig;
use crate::server::auth::Authenticator;
use crate::server::group_bus::{GroupBus, GroupBusConfig, LocalGroupBus};
use crate::server::health::HealthState;
use crate::server::pipeline::{MessagePipeline, UploadPolicy};
use crate::server::presence::PresenceTracker;
use crate::server::profile::ProfileFanout;
use crate::server::receipts::ReadReceiptTracker;
use crate::server::store::ChatStore;

/// Per-connection limits shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
	pub max_frame_bytes: usize,
	pub max_transport_bytes: usize,
	pub queue_capacity: usize,
}

/// Shared server state. Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct ServerState {
	pub bus: Arc<dyn GroupBus>,
	pub store: Arc<dyn ChatStore>,
	pub auth: Authenticator,
	pub pipeline: MessagePipeline,
	pub presence: PresenceTracker,
	pub receipts: ReadReceiptTracker,
	/// Entry point for the profile collaborator that owns username and profile edits.
	pub profiles: ProfileFanout,
	pub health: HealthState,
	pub limits: SessionLimits,
	next_conn_id: Arc<AtomicU64>,
}

impl ServerState {
	/// Wire every component around `store`. Spawns the profile notifier, so a runtime must be running.
	pub fn new(cfg: &ServerConfig, store: Arc<dyn ChatStore>, health: HealthState) -> anyhow::Result<Self> {
		let secret = cfg
			.auth
			.hmac_secret
			.clone()
			.ok_or_else(|| anyhow!("auth.hmac_secret (or PARLEY_AUTH_HMAC_SECRET) must be set"))?;

		let bus: Arc<dyn GroupBus> = Arc::new(LocalGroupBus::new(GroupBusConfig {
			debug_logs: cfg.server.debug_bus_logs,
		}));
		let uploads = UploadPolicy::new(&cfg.uploads.allowed_extensions);
		let (profiles, _notifier) = ProfileFanout::spawn(Arc::clone(&store), Arc::clone(&bus));

		Ok(Self {
			auth: Authenticator::new(secret, Arc::clone(&store)),
			pipeline: MessagePipeline::new(Arc::clone(&store), Arc::clone(&bus), uploads),
			presence: PresenceTracker::new(Arc::clone(&store), Arc::clone(&bus)),
			receipts: ReadReceiptTracker::new(Arc::clone(&store)),
			profiles,
			health,
			limits: SessionLimits {
				max_frame_bytes: cfg.server.max_frame_bytes,
				max_transport_bytes: cfg.server.max_transport_bytes.max(cfg.server.max_frame_bytes),
				queue_capacity: cfg.server.session_queue_capacity,
			},
			bus,
			store,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub fn next_conn_id(&self) -> ConnId {
		ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
	}
}
