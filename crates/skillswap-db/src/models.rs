//! Database row types. These map directly to SQLite rows and are converted
//! into skillswap-types models at the query boundary.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use skillswap_types::models::{
    CreditTransaction, DirectMessage, Session, SessionStatus, TransactionStatus,
};

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub password: String,
    pub created_at: String,
}

pub struct SessionRow {
    pub id: String,
    pub student_id: String,
    pub teacher_id: String,
    pub skill_id: String,
    pub scheduled_start: String,
    pub scheduled_end: String,
    pub status: String,
    pub credits_per_hour: i64,
    pub reservation_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct TransactionRow {
    pub id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub amount: i64,
    pub session_id: Option<String>,
    pub status: String,
    pub created_at: String,
    pub settled_at: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    pub created_at: String,
    pub read_at: Option<String>,
}

fn uuid(field: &str, value: &str) -> Result<Uuid> {
    value
        .parse()
        .map_err(|e| anyhow!("corrupt {} '{}': {}", field, value, e))
}

fn time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow!("corrupt {} '{}': {}", field, value, e))
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Session {
            id: uuid("session id", &row.id)?,
            student_id: uuid("student_id", &row.student_id)?,
            teacher_id: uuid("teacher_id", &row.teacher_id)?,
            skill_id: uuid("skill_id", &row.skill_id)?,
            scheduled_start: time("scheduled_start", &row.scheduled_start)?,
            scheduled_end: time("scheduled_end", &row.scheduled_end)?,
            status: SessionStatus::parse(&row.status)
                .ok_or_else(|| anyhow!("corrupt session status '{}'", row.status))?,
            credits_per_hour: row.credits_per_hour,
            reservation_id: row
                .reservation_id
                .as_deref()
                .map(|id| uuid("reservation_id", id))
                .transpose()?,
            created_at: time("created_at", &row.created_at)?,
            updated_at: time("updated_at", &row.updated_at)?,
        })
    }
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = anyhow::Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(CreditTransaction {
            id: uuid("transaction id", &row.id)?,
            from_user_id: uuid("from_user_id", &row.from_user_id)?,
            to_user_id: uuid("to_user_id", &row.to_user_id)?,
            amount: row.amount,
            session_id: row
                .session_id
                .as_deref()
                .map(|id| uuid("session_id", id))
                .transpose()?,
            status: TransactionStatus::parse(&row.status)
                .ok_or_else(|| anyhow!("corrupt transaction status '{}'", row.status))?,
            created_at: time("created_at", &row.created_at)?,
            settled_at: row
                .settled_at
                .as_deref()
                .map(|t| time("settled_at", t))
                .transpose()?,
        })
    }
}

impl TryFrom<MessageRow> for DirectMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(DirectMessage {
            id: uuid("message id", &row.id)?,
            sender_id: uuid("sender_id", &row.sender_id)?,
            recipient_id: uuid("recipient_id", &row.recipient_id)?,
            body: row.body,
            created_at: time("created_at", &row.created_at)?,
            read_at: row
                .read_at
                .as_deref()
                .map(|t| time("read_at", t))
                .transpose()?,
        })
    }
}
