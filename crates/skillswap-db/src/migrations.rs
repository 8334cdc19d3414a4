use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            email         TEXT NOT NULL UNIQUE,
            display_name  TEXT NOT NULL,
            password      TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            student_id        TEXT NOT NULL,
            teacher_id        TEXT NOT NULL,
            skill_id          TEXT NOT NULL,
            scheduled_start   TEXT NOT NULL,
            scheduled_end     TEXT NOT NULL,
            status            TEXT NOT NULL,
            credits_per_hour  INTEGER NOT NULL CHECK (credits_per_hour > 0),
            reservation_id    TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_student ON sessions(student_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_teacher ON sessions(teacher_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

        -- Append-only; only the status and settled_at columns ever change.
        CREATE TABLE IF NOT EXISTS credit_transactions (
            id            TEXT PRIMARY KEY,
            from_user_id  TEXT NOT NULL,
            to_user_id    TEXT NOT NULL,
            amount        INTEGER NOT NULL CHECK (amount > 0),
            session_id    TEXT,
            status        TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            settled_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_from
            ON credit_transactions(from_user_id, status);
        CREATE INDEX IF NOT EXISTS idx_transactions_to
            ON credit_transactions(to_user_id, status);

        -- At most one live transfer per session
        CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_session_live
            ON credit_transactions(session_id)
            WHERE status != 'cancelled';

        CREATE TABLE IF NOT EXISTS messages (
            id            TEXT PRIMARY KEY,
            sender_id     TEXT NOT NULL REFERENCES users(id),
            recipient_id  TEXT NOT NULL REFERENCES users(id),
            body          TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            read_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, recipient_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
