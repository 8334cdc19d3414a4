use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use skillswap_types::events::NotificationEvent;
use skillswap_types::models::{ConnectionId, UserInfo};

use crate::presence::PresenceBroadcaster;

/// Targeted events buffered per connection. A client that falls this far
/// behind loses events instead of growing the queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Outbound queue of a single connection.
pub type EventSender = mpsc::Sender<NotificationEvent>;

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub user_id: Uuid,
    pub connection_id: ConnectionId,
    pub identity: UserInfo,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

struct LiveConnection {
    record: ConnectionRecord,
    sender: EventSender,
}

/// All live connections of one user. Present in the table only while non-empty.
pub(crate) struct UserEntry {
    info: UserInfo,
    connections: HashMap<ConnectionId, LiveConnection>,
}

pub(crate) type UserTable = Arc<DashMap<Uuid, UserEntry>>;

/// Owned, lifecycle-scoped registry of live connections keyed by user.
///
/// Each user's connection set is mutated under that user's map entry lock, so
/// changes for one user serialize while different users proceed in parallel.
/// Presence transitions are broadcast while the entry lock is still held,
/// which keeps a user's online/offline events in the order they happened.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    users: UserTable,
    /// connection_id -> user_id, for unregistering by connection alone
    owners: DashMap<ConnectionId, Uuid>,
    presence: PresenceBroadcaster,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let users: UserTable = Arc::new(DashMap::new());
        Self {
            inner: Arc::new(RegistryInner {
                presence: PresenceBroadcaster::new(users.clone()),
                users,
                owners: DashMap::new(),
            }),
        }
    }

    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.inner.presence
    }

    /// Add a connection to the user's set. The first connection of a user
    /// broadcasts `UserOnline` to everyone else.
    pub fn register(
        &self,
        user_id: Uuid,
        connection_id: ConnectionId,
        identity: UserInfo,
        sender: EventSender,
    ) {
        let now = Utc::now();
        let mut entry = self
            .inner
            .users
            .entry(user_id)
            .or_insert_with(|| UserEntry {
                info: identity.clone(),
                connections: HashMap::new(),
            });

        // Latest identity wins, e.g. after a display name change
        entry.info = identity.clone();
        let first = entry.connections.is_empty();
        entry.connections.insert(
            connection_id,
            LiveConnection {
                record: ConnectionRecord {
                    user_id,
                    connection_id,
                    identity,
                    connected_at: now,
                    last_seen: now,
                },
                sender,
            },
        );
        self.inner.owners.insert(connection_id, user_id);

        debug!(
            "Registered connection {} for {} ({} open)",
            connection_id,
            user_id,
            entry.connections.len()
        );

        if first {
            self.inner.presence.on_user_online(entry.info.clone());
        }
    }

    /// Remove a connection. The last connection of a user broadcasts
    /// `UserOffline`. Returns the owning user, or `None` for an unknown id.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Uuid> {
        let (_, user_id) = self.inner.owners.remove(&connection_id)?;

        if let Entry::Occupied(mut occupied) = self.inner.users.entry(user_id) {
            occupied.get_mut().connections.remove(&connection_id);
            debug!(
                "Unregistered connection {} for {} ({} open)",
                connection_id,
                user_id,
                occupied.get().connections.len()
            );

            if occupied.get().connections.is_empty() {
                self.inner.presence.on_user_offline(occupied.get().info.clone());
                occupied.remove();
            }
        }

        Some(user_id)
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .users
            .get(&user_id)
            .is_some_and(|entry| !entry.connections.is_empty())
    }

    /// Everyone online except `excluding`, ordered by display name.
    pub fn list_online(&self, excluding: Uuid) -> Vec<UserInfo> {
        online_users(&self.inner.users, excluding)
    }

    /// Refresh `last_seen` for a connection. Returns false for an unknown id.
    pub fn heartbeat(&self, connection_id: ConnectionId) -> bool {
        let Some(user_id) = self.inner.owners.get(&connection_id).map(|owner| *owner) else {
            return false;
        };
        let Some(mut entry) = self.inner.users.get_mut(&user_id) else {
            return false;
        };
        match entry.connections.get_mut(&connection_id) {
            Some(conn) => {
                conn.record.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn connections_for(&self, user_id: Uuid) -> Vec<ConnectionRecord> {
        self.inner
            .users
            .get(&user_id)
            .map(|entry| entry.connections.values().map(|c| c.record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.owners.len()
    }

    /// Outbound queues of every connection in the user's group.
    pub(crate) fn senders_for(&self, user_id: Uuid) -> Vec<(ConnectionId, EventSender)> {
        self.inner
            .users
            .get(&user_id)
            .map(|entry| {
                entry
                    .connections
                    .iter()
                    .map(|(id, conn)| (*id, conn.sender.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every connection without broadcasting presence. Closing the
    /// outbound queues ends each connection loop.
    pub fn shutdown(&self) {
        let count = self.inner.owners.len();
        self.inner.users.clear();
        self.inner.owners.clear();
        info!("Connection registry shut down ({} connections closed)", count);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn online_users(users: &DashMap<Uuid, UserEntry>, excluding: Uuid) -> Vec<UserInfo> {
    let mut online: Vec<UserInfo> = users
        .iter()
        .filter(|entry| *entry.key() != excluding && !entry.connections.is_empty())
        .map(|entry| entry.info.clone())
        .collect();
    online.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    online
}
