use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use skillswap_types::models::{
    ConversationSummary, CreditTransaction, DirectMessage, Session, TransactionStatus,
};

use crate::models::{MessageRow, SessionRow, TransactionRow, UserRow};
use crate::{Database, format_time};

/// Characters of the last message shown in a conversation preview.
const PREVIEW_CHARS: usize = 80;

const SESSION_COLUMNS: &str = "id, student_id, teacher_id, skill_id, scheduled_start, scheduled_end, \
     status, credits_per_hour, reservation_id, created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, from_user_id, to_user_id, amount, session_id, status, created_at, settled_at";

const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, body, created_at, read_at";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        email: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, display_name, password, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, email, display_name, password_hash, format_time(Utc::now())),
            )?;
            Ok(())
        })
    }

    /// Remove a user with no other rows pointing at it. Used to undo a
    /// registration that failed after the insert.
    pub fn delete_user(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM users WHERE id = ?1", [id])? > 0))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Sessions --

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                rusqlite::params![
                    session.id.to_string(),
                    session.student_id.to_string(),
                    session.teacher_id.to_string(),
                    session.skill_id.to_string(),
                    format_time(session.scheduled_start),
                    format_time(session.scheduled_end),
                    session.status.as_str(),
                    session.credits_per_hour,
                    session.reservation_id.map(|id| id.to_string()),
                    format_time(session.created_at),
                    format_time(session.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let row = stmt.query_row([id.to_string()], session_row).optional()?;
            row.map(Session::try_from).transpose()
        })
    }

    /// Persist the mutable fields of a session: status, schedule and reservation.
    pub fn update_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions
                 SET status = ?2, scheduled_start = ?3, scheduled_end = ?4,
                     reservation_id = ?5, updated_at = ?6
                 WHERE id = ?1",
                rusqlite::params![
                    session.id.to_string(),
                    session.status.as_str(),
                    format_time(session.scheduled_start),
                    format_time(session.scheduled_end),
                    session.reservation_id.map(|id| id.to_string()),
                    format_time(session.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(anyhow!("Session not found: {}", session.id));
            }
            Ok(())
        })
    }

    pub fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            query_sessions(
                conn,
                "student_id = ?1 OR teacher_id = ?1 ORDER BY scheduled_start DESC",
                &[&user_id.to_string()],
            )
        })
    }

    /// Pending sessions created before `created_before` or whose start time has passed.
    pub fn stale_pending_sessions(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            query_sessions(
                conn,
                "status = 'pending' AND (created_at < ?1 OR scheduled_start <= ?2)",
                &[&format_time(created_before), &format_time(now)],
            )
        })
    }

    /// Confirmed sessions whose scheduled end has passed.
    pub fn due_confirmed_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            query_sessions(
                conn,
                "status = 'confirmed' AND scheduled_end <= ?1",
                &[&format_time(now)],
            )
        })
    }

    // -- Credit transactions --

    pub fn completed_balance(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| query_completed_balance(conn, user_id))
    }

    pub fn get_transaction(&self, id: Uuid) -> Result<Option<CreditTransaction>> {
        self.with_conn(|conn| query_transaction(conn, id))
    }

    pub fn live_transaction_for_session(&self, session_id: Uuid) -> Result<Option<CreditTransaction>> {
        self.with_conn(|conn| query_live_transaction_for_session(conn, session_id))
    }

    pub fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions
                 WHERE from_user_id = ?1 OR to_user_id = ?1
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt
                .query_map([user_id.to_string()], transaction_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(CreditTransaction::try_from).collect()
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &DirectMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                rusqlite::params![
                    message.id.to_string(),
                    message.sender_id.to_string(),
                    message.recipient_id.to_string(),
                    message.body,
                    format_time(message.created_at),
                    message.read_at.map(format_time),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<DirectMessage>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
            let row = stmt.query_row([id.to_string()], message_row).optional()?;
            row.map(DirectMessage::try_from).transpose()
        })
    }

    /// Stamp `read_at` on an unread message. Returns false if it was already read.
    pub fn mark_message_read(&self, id: Uuid, read_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET read_at = ?2 WHERE id = ?1 AND read_at IS NULL",
                (id.to_string(), format_time(read_at)),
            )?;
            Ok(changed > 0)
        })
    }

    /// Messages exchanged between two users, newest first.
    pub fn conversation(&self, a: Uuid, b: Uuid, limit: u32) -> Result<Vec<DirectMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE (sender_id = ?1 AND recipient_id = ?2)
                    OR (sender_id = ?2 AND recipient_id = ?1)
                 ORDER BY created_at DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![a.to_string(), b.to_string(), limit], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(DirectMessage::try_from).collect()
        })
    }

    /// Conversation summary as seen by `owner_id`. `None` if they never exchanged messages.
    pub fn conversation_summary(
        &self,
        owner_id: Uuid,
        peer_id: Uuid,
    ) -> Result<Option<ConversationSummary>> {
        let Some(last) = self.conversation(owner_id, peer_id, 1)?.into_iter().next() else {
            return Ok(None);
        };

        let unread: u32 = self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE sender_id = ?1 AND recipient_id = ?2 AND read_at IS NULL",
                (peer_id.to_string(), owner_id.to_string()),
                |row| row.get(0),
            )?)
        })?;

        Ok(Some(ConversationSummary {
            owner_id,
            peer_id,
            last_message_preview: last.body.chars().take(PREVIEW_CHARS).collect(),
            last_message_at: last.created_at,
            unread_count: unread,
        }))
    }
}

// -- Connection-level helpers, composable inside a single SQLite transaction --

/// Completed credits received minus completed credits sent.
pub fn query_completed_balance(conn: &Connection, user_id: Uuid) -> Result<i64> {
    let balance = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN to_user_id = ?1 THEN amount ELSE 0 END), 0)
          - COALESCE(SUM(CASE WHEN from_user_id = ?1 THEN amount ELSE 0 END), 0)
         FROM credit_transactions
         WHERE status = 'completed' AND (from_user_id = ?1 OR to_user_id = ?1)",
        [user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(balance)
}

pub fn insert_transaction(conn: &Connection, tx: &CreditTransaction) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO credit_transactions ({TRANSACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        rusqlite::params![
            tx.id.to_string(),
            tx.from_user_id.to_string(),
            tx.to_user_id.to_string(),
            tx.amount,
            tx.session_id.map(|id| id.to_string()),
            tx.status.as_str(),
            format_time(tx.created_at),
            tx.settled_at.map(format_time),
        ],
    )?;
    Ok(())
}

pub fn query_transaction(conn: &Connection, id: Uuid) -> Result<Option<CreditTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE id = ?1"
    ))?;
    let row = stmt.query_row([id.to_string()], transaction_row).optional()?;
    row.map(CreditTransaction::try_from).transpose()
}

/// The pending or completed transaction attached to a session, if any.
pub fn query_live_transaction_for_session(
    conn: &Connection,
    session_id: Uuid,
) -> Result<Option<CreditTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions
         WHERE session_id = ?1 AND status != 'cancelled'"
    ))?;
    let row = stmt.query_row([session_id.to_string()], transaction_row).optional()?;
    row.map(CreditTransaction::try_from).transpose()
}

/// Move a transaction out of `from` into `to`. Returns the number of rows
/// changed, which is zero if the transaction was no longer in `from`.
pub fn update_transaction_status(
    conn: &Connection,
    id: Uuid,
    from: TransactionStatus,
    to: TransactionStatus,
    settled_at: DateTime<Utc>,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE credit_transactions SET status = ?3, settled_at = ?4 WHERE id = ?1 AND status = ?2",
        (id.to_string(), from.as_str(), to.as_str(), format_time(settled_at)),
    )?;
    Ok(changed)
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, email, display_name, password, created_at FROM users WHERE {column} = ?1"
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                email: row.get(1)?,
                display_name: row.get(2)?,
                password: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_sessions(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE {filter}"))?;
    let rows = stmt
        .query_map(params, session_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(Session::try_from).collect()
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        teacher_id: row.get(2)?,
        skill_id: row.get(3)?,
        scheduled_start: row.get(4)?,
        scheduled_end: row.get(5)?,
        status: row.get(6)?,
        credits_per_hour: row.get(7)?,
        reservation_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn transaction_row(row: &Row<'_>) -> rusqlite::Result<TransactionRow> {
    Ok(TransactionRow {
        id: row.get(0)?,
        from_user_id: row.get(1)?,
        to_user_id: row.get(2)?,
        amount: row.get(3)?,
        session_id: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        settled_at: row.get(7)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
        read_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_unique_violation;
    use chrono::Duration;
    use skillswap_types::models::SessionStatus;

    fn session(student: Uuid, teacher: Uuid, start: DateTime<Utc>) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            student_id: student,
            teacher_id: teacher,
            skill_id: Uuid::new_v4(),
            scheduled_start: start,
            scheduled_end: start + Duration::hours(1),
            status: SessionStatus::Pending,
            credits_per_hour: 5,
            reservation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transfer(from: Uuid, to: Uuid, amount: i64, status: TransactionStatus) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            from_user_id: from,
            to_user_id: to,
            amount,
            session_id: None,
            status,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    fn user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), &format!("{name}@example.com"), name, "hash")
            .unwrap();
        id
    }

    #[test]
    fn session_roundtrips_through_storage() {
        let db = Database::open_in_memory().unwrap();
        let mut s = session(Uuid::new_v4(), Uuid::new_v4(), Utc::now() + Duration::days(1));
        db.insert_session(&s).unwrap();

        s.status = SessionStatus::Confirmed;
        s.reservation_id = Some(Uuid::new_v4());
        db.update_session(&s).unwrap();

        let loaded = db.get_session(s.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Confirmed);
        assert_eq!(loaded.reservation_id, s.reservation_id);
        assert_eq!(loaded.scheduled_start.timestamp_millis(), s.scheduled_start.timestamp_millis());
        assert!(db.get_session(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn updating_missing_session_fails() {
        let db = Database::open_in_memory().unwrap();
        let s = session(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        assert!(db.update_session(&s).is_err());
    }

    #[test]
    fn stale_and_due_session_queries() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();

        let started = session(a, b, now - Duration::minutes(5));
        let future = session(a, b, now + Duration::days(2));
        let mut finished = session(a, b, now - Duration::hours(3));
        finished.status = SessionStatus::Confirmed;
        for s in [&started, &future, &finished] {
            db.insert_session(s).unwrap();
        }

        let stale = db.stale_pending_sessions(now - Duration::days(7), now).unwrap();
        assert_eq!(stale.iter().map(|s| s.id).collect::<Vec<_>>(), vec![started.id]);

        let due = db.due_confirmed_sessions(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, finished.id);

        assert_eq!(db.sessions_for_user(b).unwrap().len(), 3);
    }

    #[test]
    fn balance_counts_only_completed_transfers() {
        let db = Database::open_in_memory().unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        db.with_conn(|conn| {
            insert_transaction(conn, &transfer(alice, bob, 7, TransactionStatus::Completed))?;
            insert_transaction(conn, &transfer(bob, alice, 3, TransactionStatus::Completed))?;
            insert_transaction(conn, &transfer(alice, bob, 50, TransactionStatus::Pending))?;
            insert_transaction(conn, &transfer(alice, bob, 50, TransactionStatus::Cancelled))?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.completed_balance(alice).unwrap(), -4);
        assert_eq!(db.completed_balance(bob).unwrap(), 4);
        assert_eq!(db.completed_balance(Uuid::new_v4()).unwrap(), 0);
        assert_eq!(db.transactions_for_user(alice).unwrap().len(), 4);
    }

    #[test]
    fn status_update_only_applies_from_expected_state() {
        let db = Database::open_in_memory().unwrap();
        let tx = transfer(Uuid::new_v4(), Uuid::new_v4(), 5, TransactionStatus::Pending);
        let now = Utc::now();
        db.with_conn(|conn| {
            insert_transaction(conn, &tx)?;
            let first = update_transaction_status(
                conn,
                tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Completed,
                now,
            )?;
            let second = update_transaction_status(
                conn,
                tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Cancelled,
                now,
            )?;
            assert_eq!((first, second), (1, 0));
            Ok(())
        })
        .unwrap();

        let stored = db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert!(stored.settled_at.is_some());
    }

    #[test]
    fn one_live_transfer_per_session() {
        let db = Database::open_in_memory().unwrap();
        let session_id = Some(Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut first = transfer(a, b, 5, TransactionStatus::Cancelled);
        first.session_id = session_id;
        let mut second = transfer(a, b, 5, TransactionStatus::Pending);
        second.session_id = session_id;
        let mut third = transfer(a, b, 5, TransactionStatus::Pending);
        third.session_id = session_id;

        db.with_conn(|conn| {
            insert_transaction(conn, &first)?;
            insert_transaction(conn, &second)?;
            assert!(insert_transaction(conn, &third).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn conversation_summary_tracks_unread() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let base = Utc::now();

        for (i, (from, to, body)) in [(alice, bob, "hi bob"), (bob, alice, "hey"), (bob, alice, "free tomorrow?")]
            .into_iter()
            .enumerate()
        {
            db.insert_message(&DirectMessage {
                id: Uuid::new_v4(),
                sender_id: from,
                recipient_id: to,
                body: body.into(),
                created_at: base + Duration::seconds(i as i64),
                read_at: None,
            })
            .unwrap();
        }

        let summary = db.conversation_summary(alice, bob).unwrap().unwrap();
        assert_eq!(summary.unread_count, 2);
        assert_eq!(summary.last_message_preview, "free tomorrow?");

        let latest = db.conversation(alice, bob, 10).unwrap();
        assert_eq!(latest.len(), 3);
        assert!(db.mark_message_read(latest[0].id, Utc::now()).unwrap());
        assert!(!db.mark_message_read(latest[0].id, Utc::now()).unwrap());
        assert_eq!(db.conversation_summary(alice, bob).unwrap().unwrap().unread_count, 1);

        assert!(db.conversation_summary(alice, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn users_lookup_by_email_and_id() {
        let db = Database::open_in_memory().unwrap();
        let id = user(&db, "carol");
        let row = db.get_user_by_email("carol@example.com").unwrap().unwrap();
        assert_eq!(row.id, id.to_string());
        assert_eq!(db.get_user_by_id(&row.id).unwrap().unwrap().display_name, "carol");
        assert!(db.get_user_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn duplicate_email_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        let first = Uuid::new_v4().to_string();
        db.create_user(&first, "ada@example.com", "Ada", "hash").unwrap();

        let err = db
            .create_user(&Uuid::new_v4().to_string(), "ada@example.com", "Other", "hash")
            .unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!crate::is_transient(&err));

        // Once the first row is gone the email is free again
        assert!(db.delete_user(&first).unwrap());
        assert!(!db.delete_user(&first).unwrap());
        assert!(db.get_user_by_email("ada@example.com").unwrap().is_none());
        db.create_user(&Uuid::new_v4().to_string(), "ada@example.com", "Ada", "hash")
            .unwrap();
    }
}
