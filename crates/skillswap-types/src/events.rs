use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationSummary, DirectMessage, Session, UserInfo};

/// Events pushed to browser clients over the gateway.
///
/// Serialized as `{"type": <name>, "data": <payload>}`, so the variant name is
/// the event name seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NotificationEvent {
    /// Server accepted the connection
    Ready { user: UserInfo },

    /// Users already online when this connection was opened
    PresenceSnapshot { users: Vec<UserInfo> },

    /// A direct message arrived for the recipient
    MessageReceived(DirectMessage),

    /// A conversation's preview or unread count changed
    ConversationUpdated(ConversationSummary),

    /// The recipient read a message this user sent
    MessageRead {
        message_id: Uuid,
        read_at: DateTime<Utc>,
    },

    UserOnline(UserInfo),

    UserOffline(UserInfo),

    /// A booking the user participates in changed state or time
    SessionUpdated(Session),
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "Ready",
            Self::PresenceSnapshot { .. } => "PresenceSnapshot",
            Self::MessageReceived(_) => "MessageReceived",
            Self::ConversationUpdated(_) => "ConversationUpdated",
            Self::MessageRead { .. } => "MessageRead",
            Self::UserOnline(_) => "UserOnline",
            Self::UserOffline(_) => "UserOffline",
            Self::SessionUpdated(_) => "SessionUpdated",
        }
    }

    /// The user a presence event is about. `None` for targeted events.
    pub fn presence_subject(&self) -> Option<Uuid> {
        match self {
            Self::UserOnline(info) | Self::UserOffline(info) => Some(info.user_id),
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Keep-alive; refreshes the connection's last-seen time
    Heartbeat,
}
