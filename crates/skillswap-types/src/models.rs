use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account that mints signup credits. Its balance is allowed to go negative.
pub const SYSTEM_ACCOUNT: Uuid = Uuid::nil();

/// Identifies one live gateway connection (one browser tab or device).
pub type ConnectionId = Uuid;

/// Authenticated identity attached to a connection or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booked skill-exchange session between a student and a teacher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub student_id: Uuid,
    pub teacher_id: Uuid,
    pub skill_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub status: SessionStatus,
    pub credits_per_hour: i64,
    /// Pending ledger transaction created on confirm.
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn duration(&self) -> Duration {
        self.scheduled_end - self.scheduled_start
    }

    /// Credits the student owes for the scheduled duration, rounded up to a whole credit.
    pub fn cost(&self) -> i64 {
        session_cost(self.duration(), self.credits_per_hour)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.student_id == user_id || self.teacher_id == user_id
    }
}

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// `ceil(duration * credits_per_hour)`, at millisecond resolution. Any
/// positive duration at a positive rate costs at least one credit.
pub fn session_cost(duration: Duration, credits_per_hour: i64) -> i64 {
    let total = duration.num_milliseconds().saturating_mul(credits_per_hour);
    if total <= 0 {
        return 0;
    }
    total / MILLIS_PER_HOUR + i64::from(total % MILLIS_PER_HOUR != 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transfer of credits. Debits `from_user_id` and credits `to_user_id`
/// once completed; pending and cancelled rows never count toward a balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub amount: i64,
    pub session_id: Option<Uuid>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Conversation list entry as seen by `owner_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub owner_id: Uuid,
    pub peer_id: Uuid,
    pub last_message_preview: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u32,
}
