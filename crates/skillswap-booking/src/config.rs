use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for the booking workflow. Defaults match the server's
/// environment defaults.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// Earliest a rescheduled session may start, measured from now.
    pub reschedule_buffer: chrono::Duration,
    /// Pending sessions older than this are cancelled by the sweeper.
    pub pending_ttl: chrono::Duration,
    /// Upper bound on a single persistence call.
    pub store_timeout: Duration,
    /// Retry policy for ledger commit/cancel.
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            reschedule_buffer: chrono::Duration::minutes(30),
            pending_ttl: chrono::Duration::days(7),
            store_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
