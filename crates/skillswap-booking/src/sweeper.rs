use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::service::BookingService;
use crate::session::Actor;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending sessions cancelled for never being confirmed in time
    pub expired: usize,
    /// Confirmed sessions completed after their scheduled end
    pub completed: usize,
    pub failed: usize,
}

/// Background task that applies time-driven transitions.
///
/// Runs on an interval. Pending sessions past the pending TTL, or whose start
/// time has already passed, are cancelled; confirmed sessions past their end
/// are completed. Failures are logged and picked up again on the next tick.
pub async fn run_sweep_loop(service: Arc<BookingService>) {
    let mut interval = tokio::time::interval(service.config().sweep_interval);

    loop {
        interval.tick().await;

        match sweep_once(&service, Utc::now()).await {
            Ok(report) => {
                if report != SweepReport::default() {
                    info!(
                        "Sweep: expired {}, completed {}, failed {}",
                        report.expired, report.completed, report.failed
                    );
                }
            }
            Err(e) => {
                warn!("Sweep error: {}", e);
            }
        }
    }
}

pub async fn sweep_once(service: &BookingService, now: DateTime<Utc>) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let db = service.db().clone();
    let cutoff = now - service.config().pending_ttl;
    let stale = service
        .blocking(move || Ok(db.stale_pending_sessions(cutoff, now)?))
        .await?;

    for session in stale {
        match service.cancel_session(Actor::System, session.id, now).await {
            Ok(_) => report.expired += 1,
            Err(e) => {
                warn!("Could not expire session {}: {}", session.id, e);
                report.failed += 1;
            }
        }
    }

    let db = service.db().clone();
    let due = service
        .blocking(move || Ok(db.due_confirmed_sessions(now)?))
        .await?;

    for session in due {
        match service.complete_session(Actor::System, session.id, now).await {
            Ok(_) => report.completed += 1,
            Err(e) => {
                warn!("Could not complete session {}: {}", session.id, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookingConfig;
    use crate::session::NewSession;
    use chrono::Duration;
    use skillswap_db::Database;
    use skillswap_gateway::{ConnectionRegistry, GroupRouter};
    use skillswap_types::models::SessionStatus;
    use uuid::Uuid;

    fn service() -> BookingService {
        BookingService::new(
            Arc::new(Database::open_in_memory().unwrap()),
            GroupRouter::new(ConnectionRegistry::new()),
            BookingConfig::default(),
        )
    }

    fn booking(teacher: Uuid, created: DateTime<Utc>, start_in: Duration) -> NewSession {
        NewSession {
            teacher_id: teacher,
            skill_id: Uuid::new_v4(),
            scheduled_start: created + start_in,
            scheduled_end: created + start_in + Duration::hours(1),
            credits_per_hour: 4,
        }
    }

    #[tokio::test]
    async fn expires_stale_pending_and_completes_elapsed() {
        let service = service();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        service.ledger().grant(alice, 10).unwrap();
        let now = Utc::now();

        // Requested 8 days ago for a slot 30 days out: past the pending TTL
        let old = now - Duration::days(8);
        let abandoned = service
            .create_session(alice, booking(bob, old, Duration::days(30)), old)
            .await
            .unwrap();

        // Booked yesterday for a slot that has already ended
        let yesterday = now - Duration::days(1);
        let elapsed = service
            .create_session(alice, booking(bob, yesterday, Duration::hours(2)), yesterday)
            .await
            .unwrap();
        service.confirm_session(bob, elapsed.id, yesterday).await.unwrap();

        // Fresh request for next week: left alone
        let fresh = service
            .create_session(alice, booking(bob, now, Duration::days(7)), now)
            .await
            .unwrap();

        let report = sweep_once(&service, now).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                completed: 1,
                failed: 0
            }
        );

        let status = |id: Uuid| {
            let service = &service;
            async move { service.get_session(alice, id).await.unwrap().status }
        };
        assert_eq!(status(abandoned.id).await, SessionStatus::Cancelled);
        assert_eq!(status(elapsed.id).await, SessionStatus::Completed);
        assert_eq!(status(fresh.id).await, SessionStatus::Pending);
        assert_eq!(service.ledger().balance(bob).unwrap(), 4);

        // Nothing left to do
        assert_eq!(sweep_once(&service, now).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn unpaid_completion_is_reported_and_retried_later() {
        let service = service();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        service.ledger().grant(alice, 4).unwrap();
        let yesterday = Utc::now() - Duration::days(1);

        let first = service
            .create_session(alice, booking(bob, yesterday, Duration::hours(2)), yesterday)
            .await
            .unwrap();
        let second = service
            .create_session(alice, booking(carol, yesterday, Duration::hours(4)), yesterday)
            .await
            .unwrap();
        service.confirm_session(bob, first.id, yesterday).await.unwrap();
        service.confirm_session(carol, second.id, yesterday).await.unwrap();

        let report = sweep_once(&service, Utc::now()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(service.ledger().balance(alice).unwrap(), 0);
    }
}
