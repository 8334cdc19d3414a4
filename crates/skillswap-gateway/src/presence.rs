use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use skillswap_types::events::NotificationEvent;
use skillswap_types::models::UserInfo;

use crate::registry::{UserTable, online_users};

/// Events buffered per subscriber before a slow connection starts lagging.
const PRESENCE_CHANNEL_CAPACITY: usize = 1024;

/// Fans presence transitions out to every connected client.
///
/// One in-process broadcast channel carries every event, so the cost of an
/// event is O(connections). There is no sharding; this is the scalability
/// bound of a single-process deployment.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    users: UserTable,
    tx: broadcast::Sender<NotificationEvent>,
}

impl PresenceBroadcaster {
    pub(crate) fn new(users: UserTable) -> Self {
        let (tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self { users, tx }
    }

    pub fn on_user_online(&self, info: UserInfo) {
        debug!("{} ({}) is online", info.display_name, info.user_id);
        self.send_to_all(NotificationEvent::UserOnline(info));
    }

    pub fn on_user_offline(&self, info: UserInfo) {
        debug!("{} ({}) is offline", info.display_name, info.user_id);
        self.send_to_all(NotificationEvent::UserOffline(info));
    }

    /// Broadcast an event to every subscribed connection. Having no
    /// subscribers is not an error.
    pub fn send_to_all(&self, event: NotificationEvent) {
        let _ = self.tx.send(event);
    }

    /// Feed of broadcast events for one viewer. Presence events about the
    /// viewer themselves are filtered out.
    pub fn subscribe(&self, viewer: Uuid) -> PresenceFeed {
        PresenceFeed {
            viewer,
            rx: self.tx.subscribe(),
        }
    }

    /// Users currently online other than `user_id`, used to backfill a
    /// freshly opened connection.
    pub fn snapshot_for(&self, user_id: Uuid) -> Vec<UserInfo> {
        online_users(&self.users, user_id)
    }
}

pub struct PresenceFeed {
    viewer: Uuid,
    rx: broadcast::Receiver<NotificationEvent>,
}

impl PresenceFeed {
    /// Next event for this viewer, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.is_own(&event) => continue,
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Presence feed for {} lagged by {} events", self.viewer, n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). Returns `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<NotificationEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.is_own(&event) => continue,
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Presence feed for {} lagged by {} events", self.viewer, n);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn is_own(&self, event: &NotificationEvent) -> bool {
        event.presence_subject() == Some(self.viewer)
    }
}
