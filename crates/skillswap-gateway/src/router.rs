use std::collections::HashSet;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use skillswap_types::events::NotificationEvent;

use crate::registry::ConnectionRegistry;

/// Delivers targeted events to the connection group of a single user.
///
/// Delivery is at-most-once with no persistence: if the user has no live
/// connection the event is dropped and the client reconciles by fetching
/// state on its next connect.
#[derive(Clone)]
pub struct GroupRouter {
    registry: ConnectionRegistry,
}

impl GroupRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Send `event` to every connection of `target_user_id`. Returns how many
    /// connections accepted it.
    pub fn route(&self, event: NotificationEvent, target_user_id: Uuid) -> usize {
        let senders = self.registry.senders_for(target_user_id);
        if senders.is_empty() {
            trace!("{} for {} dropped: no live connection", event.name(), target_user_id);
            return 0;
        }

        let mut delivered = 0;
        for (connection_id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "{} for {} dropped: connection {} queue full",
                        event.name(),
                        target_user_id,
                        connection_id
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        "{} for {} dropped: connection {} closing",
                        event.name(),
                        target_user_id,
                        connection_id
                    );
                }
            }
        }
        delivered
    }

    /// Route one event to several users, each at most once.
    pub fn route_to_many(
        &self,
        event: NotificationEvent,
        targets: impl IntoIterator<Item = Uuid>,
    ) -> usize {
        let mut seen = HashSet::new();
        targets
            .into_iter()
            .filter(|user_id| seen.insert(*user_id))
            .map(|user_id| self.route(event.clone(), user_id))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skillswap_types::models::UserInfo;
    use tokio::sync::mpsc;

    fn user(name: &str) -> UserInfo {
        UserInfo {
            user_id: Uuid::new_v4(),
            email: format!("{}@example.com", name.to_lowercase()),
            display_name: name.to_string(),
        }
    }

    fn read_receipt() -> NotificationEvent {
        NotificationEvent::MessageRead {
            message_id: Uuid::new_v4(),
            read_at: Utc::now(),
        }
    }

    #[test]
    fn routes_only_to_target_group() {
        let registry = ConnectionRegistry::new();
        let router = GroupRouter::new(registry.clone());
        let alice = user("Alice");
        let bob = user("Bob");

        let (a1_tx, mut a1_rx) = mpsc::channel(8);
        let (a2_tx, mut a2_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), a1_tx);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), a2_tx);
        registry.register(bob.user_id, Uuid::new_v4(), bob.clone(), b_tx);

        let event = read_receipt();
        assert_eq!(router.route(event.clone(), alice.user_id), 2);
        assert_eq!(a1_rx.try_recv().unwrap(), event);
        assert_eq!(a2_rx.try_recv().unwrap(), event);
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn offline_target_drops_silently() {
        let registry = ConnectionRegistry::new();
        let router = GroupRouter::new(registry);
        assert_eq!(router.route(read_receipt(), Uuid::new_v4()), 0);
    }

    #[test]
    fn closed_connection_is_skipped() {
        let registry = ConnectionRegistry::new();
        let router = GroupRouter::new(registry.clone());
        let alice = user("Alice");

        let (dead_tx, dead_rx) = mpsc::channel(8);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), dead_tx);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), live_tx);
        drop(dead_rx);

        assert_eq!(router.route(read_receipt(), alice.user_id), 1);
        assert!(live_rx.try_recv().is_ok());
    }

    #[test]
    fn full_queue_drops_instead_of_growing() {
        let registry = ConnectionRegistry::new();
        let router = GroupRouter::new(registry.clone());
        let alice = user("Alice");

        let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), stalled_tx);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), live_tx);

        assert_eq!(router.route(read_receipt(), alice.user_id), 2);
        // The stalled connection never drained its single slot
        assert_eq!(router.route(read_receipt(), alice.user_id), 1);

        assert!(stalled_rx.try_recv().is_ok());
        assert!(stalled_rx.try_recv().is_err());
        assert!(live_rx.try_recv().is_ok());
        assert!(live_rx.try_recv().is_ok());
    }

    #[test]
    fn route_to_many_deduplicates_targets() {
        let registry = ConnectionRegistry::new();
        let router = GroupRouter::new(registry.clone());
        let alice = user("Alice");
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(alice.user_id, Uuid::new_v4(), alice.clone(), tx);

        assert_eq!(router.route_to_many(read_receipt(), [alice.user_id, alice.user_id]), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
