#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parley_domain::{ConnId, GroupName};
use parley_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Items emitted on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum BusItem {
	Event(Arc<ServerEvent>),

	/// The connection's queue was full and this many events were dropped.
	Lagged {
		dropped: u64,
	},
}

/// Sending half of a connection's outbound queue. One per connection, shared by all groups it joins.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnId,
	tx: mpsc::Sender<BusItem>,
}

impl ConnectionHandle {
	pub fn channel(id: ConnId, capacity: usize) -> (Self, mpsc::Receiver<BusItem>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self { id, tx }, rx)
	}

	pub fn id(&self) -> ConnId {
		self.id
	}

	/// Queue an event for this connection only. Returns false if the queue is full or closed.
	pub fn send_local(&self, event: ServerEvent) -> bool {
		self.tx.try_send(BusItem::Event(Arc::new(event))).is_ok()
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
	pub delivered: usize,
	pub dropped: usize,
}

/// Named-group fanout. The only path by which events reach other connections.
#[async_trait::async_trait]
pub trait GroupBus: Send + Sync {
	/// Idempotent.
	async fn join(&self, group: &GroupName, conn: &ConnectionHandle);

	/// Idempotent.
	async fn leave(&self, group: &GroupName, conn: ConnId);

	/// Leave every group `conn` belongs to and return them.
	async fn leave_all(&self, conn: ConnId) -> Vec<GroupName>;

	async fn publish(&self, group: &GroupName, event: ServerEvent) -> PublishReport;

	async fn members(&self, group: &GroupName) -> Vec<ConnId>;

	async fn groups_of(&self, conn: ConnId) -> Vec<GroupName>;
}

#[derive(Debug, Clone, Default)]
pub struct GroupBusConfig {
	pub debug_logs: bool,
}

/// In-process bus: a single mutex-guarded membership table.
#[derive(Debug, Clone)]
pub struct LocalGroupBus {
	inner: Arc<Mutex<Inner>>,
	cfg: GroupBusConfig,
}

#[derive(Debug, Default)]
struct Inner {
	groups: HashMap<GroupName, BTreeMap<ConnId, Member>>,
	memberships: HashMap<ConnId, HashSet<GroupName>>,
}

#[derive(Debug)]
struct Member {
	tx: mpsc::Sender<BusItem>,
	pending_lag: u64,
}

impl LocalGroupBus {
	pub fn new(cfg: GroupBusConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Snapshot of member counts per group.
	pub async fn group_sizes(&self) -> HashMap<GroupName, usize> {
		let inner = self.inner.lock().await;
		inner.groups.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}
}

impl Default for LocalGroupBus {
	fn default() -> Self {
		Self::new(GroupBusConfig::default())
	}
}

impl Inner {
	fn remove_member(&mut self, group: &GroupName, conn: ConnId) {
		if let Some(members) = self.groups.get_mut(group) {
			members.remove(&conn);
			if members.is_empty() {
				self.groups.remove(group);
			}
		}

		if let Some(groups) = self.memberships.get_mut(&conn) {
			groups.remove(group);
			if groups.is_empty() {
				self.memberships.remove(&conn);
			}
		}
	}
}

#[async_trait::async_trait]
impl GroupBus for LocalGroupBus {
	async fn join(&self, group: &GroupName, conn: &ConnectionHandle) {
		let mut inner = self.inner.lock().await;
		let members = inner.groups.entry(group.clone()).or_default();
		members.entry(conn.id).or_insert_with(|| Member {
			tx: conn.tx.clone(),
			pending_lag: 0,
		});
		let size = members.len();
		inner.memberships.entry(conn.id).or_default().insert(group.clone());

		if self.cfg.debug_logs {
			debug!(group = %group, conn_id = %conn.id, members = size, "group bus: joined");
		}
	}

	async fn leave(&self, group: &GroupName, conn: ConnId) {
		let mut inner = self.inner.lock().await;
		inner.remove_member(group, conn);

		if self.cfg.debug_logs {
			debug!(group = %group, conn_id = %conn, "group bus: left");
		}
	}

	async fn leave_all(&self, conn: ConnId) -> Vec<GroupName> {
		let mut inner = self.inner.lock().await;
		let groups: Vec<GroupName> = inner
			.memberships
			.get(&conn)
			.map(|g| g.iter().cloned().collect())
			.unwrap_or_default();

		for group in &groups {
			inner.remove_member(group, conn);
		}

		groups
	}

	async fn publish(&self, group: &GroupName, event: ServerEvent) -> PublishReport {
		let item = BusItem::Event(Arc::new(event));
		let mut report = PublishReport::default();
		let mut closed = Vec::new();

		let mut inner = self.inner.lock().await;
		let Some(members) = inner.groups.get_mut(group) else {
			return report;
		};

		for (conn, member) in members.iter_mut() {
			match member.tx.try_send(item.clone()) {
				Ok(()) => {
					report.delivered += 1;
					if member.pending_lag > 0
						&& member
							.tx
							.try_send(BusItem::Lagged {
								dropped: member.pending_lag,
							})
							.is_ok()
					{
						member.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					report.dropped += 1;
					member.pending_lag = member.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*conn),
			}
		}

		for conn in closed {
			inner.remove_member(group, conn);
		}
		drop(inner);

		metrics::counter!("parley_server_bus_delivered_total").increment(report.delivered as u64);
		if report.dropped > 0 {
			metrics::counter!("parley_server_bus_dropped_total").increment(report.dropped as u64);
			if self.cfg.debug_logs {
				debug!(group = %group, dropped = report.dropped, "group bus: dropped due to full queues");
			}
		}

		report
	}

	async fn members(&self, group: &GroupName) -> Vec<ConnId> {
		let inner = self.inner.lock().await;
		inner
			.groups
			.get(group)
			.map(|m| m.keys().copied().collect())
			.unwrap_or_default()
	}

	async fn groups_of(&self, conn: ConnId) -> Vec<GroupName> {
		let inner = self.inner.lock().await;
		let mut groups: Vec<GroupName> = inner
			.memberships
			.get(&conn)
			.map(|g| g.iter().cloned().collect())
			.unwrap_or_default();
		groups.sort();
		groups
	}
}
