use thiserror::Error;
use uuid::Uuid;

/// Everything a booking or ledger operation can fail with. Validation and
/// state-machine errors are raised before any mutation.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("insufficient balance: user {user_id} has {balance} credits, {required} required")]
    InsufficientBalance {
        user_id: Uuid,
        balance: i64,
        required: i64,
    },

    #[error("cannot {action} a {from} {entity}")]
    InvalidStateTransition {
        entity: &'static str,
        from: &'static str,
        action: &'static str,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("not permitted: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    /// Only transient storage failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

impl From<anyhow::Error> for BookingError {
    fn from(err: anyhow::Error) -> Self {
        if skillswap_db::is_transient(&err) {
            Self::TransientStore(err.to_string())
        } else {
            Self::Internal(format!("{:#}", err))
        }
    }
}

pub type Result<T> = std::result::Result<T, BookingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        let busy = rusqlite_busy();
        assert!(BookingError::from(busy).is_retryable());

        let other = BookingError::from(anyhow::anyhow!("disk on fire"));
        assert!(matches!(other, BookingError::Internal(_)));
        assert!(!other.is_retryable());
    }

    #[test]
    fn transition_error_reads_naturally() {
        let err = BookingError::InvalidStateTransition {
            entity: "session",
            from: "cancelled",
            action: "confirm",
        };
        assert_eq!(err.to_string(), "cannot confirm a cancelled session");
    }

    fn rusqlite_busy() -> anyhow::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
        .into()
    }
}
