use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use skillswap_db::Database;
use skillswap_gateway::GroupRouter;
use skillswap_types::events::NotificationEvent;
use skillswap_types::models::{Session, SessionStatus, TransactionStatus};

use crate::config::BookingConfig;
use crate::error::{BookingError, Result};
use crate::ledger::CreditLedger;
use crate::retry::with_retry;
use crate::session::{self, Actor, NewSession, SessionAction};

/// Drives the session state machine against the ledger and the sessions table.
///
/// Transitions on one session are serialized by a per-session lock. Every
/// check runs before the first write, ledger commit/cancel is retried on
/// transient storage errors, and a session keeps its previous state if the
/// ledger step ultimately fails.
pub struct BookingService {
    db: Arc<Database>,
    ledger: Arc<CreditLedger>,
    router: GroupRouter,
    config: BookingConfig,
    session_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl BookingService {
    pub fn new(db: Arc<Database>, router: GroupRouter, config: BookingConfig) -> Self {
        Self {
            ledger: Arc::new(CreditLedger::new(db.clone())),
            db,
            router,
            config,
            session_locks: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &BookingConfig {
        &self.config
    }

    pub(crate) fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run blocking storage work off the async runtime, bounded by the store timeout.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.config.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("spawn_blocking join error: {}", e);
                Err(BookingError::Internal(e.to_string()))
            }
            Err(_) => Err(BookingError::TransientStore(format!(
                "storage call exceeded {:?}",
                self.config.store_timeout
            ))),
        }
    }

    // -- Queries --

    pub async fn get_session(&self, actor: Uuid, id: Uuid) -> Result<Session> {
        let session = self.load(id).await?;
        if !session.is_participant(actor) {
            return Err(BookingError::Unauthorized(
                "only participants can view this session".into(),
            ));
        }
        Ok(session)
    }

    pub async fn list_sessions(&self, actor: Uuid) -> Result<Vec<Session>> {
        let db = self.db.clone();
        self.blocking(move || Ok(db.sessions_for_user(actor)?)).await
    }

    // -- Transitions --

    /// Student books a session: `-> Pending`. No credits move.
    pub async fn create_session(
        &self,
        student_id: Uuid,
        req: NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = session::new_session(student_id, req, now)?;

        let db = self.db.clone();
        let stored = session.clone();
        self.blocking(move || Ok(db.insert_session(&stored)?)).await?;

        info!(
            "Session {} requested by {} with {} ({} credits)",
            session.id,
            session.student_id,
            session.teacher_id,
            session.cost()
        );
        self.notify(&session);
        Ok(session)
    }

    /// Teacher accepts: `Pending -> Confirmed`, reserving the session cost
    /// from the student. A reservation left by an earlier attempt that timed
    /// out is reused rather than duplicated.
    pub async fn confirm_session(&self, actor: Uuid, id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        self.serialized(id, self.confirm(actor, id, now)).await
    }

    /// Either party (or the sweeper) cancels: `Pending|Confirmed -> Cancelled`.
    /// Any reservation is released; no credits move.
    pub async fn cancel_session(&self, actor: Actor, id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        self.serialized(id, self.cancel(actor, id, now)).await
    }

    /// Teacher (or the sweeper) finishes an elapsed session:
    /// `Confirmed -> Completed`, committing the reservation.
    pub async fn complete_session(&self, actor: Actor, id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        self.serialized(id, self.complete(actor, id, now)).await
    }

    /// Either party moves an open session. Existing reservations are untouched.
    pub async fn reschedule_session(
        &self,
        actor: Uuid,
        id: Uuid,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        self.serialized(id, self.reschedule(actor, id, scheduled_start, scheduled_end, now))
            .await
    }

    // -- Internals --

    /// Run one transition holding the session's lock. The lock entry is
    /// dropped once no other transition holds or waits on it.
    async fn serialized<T>(&self, id: Uuid, work: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self.session_locks.entry(id).or_default().value().clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.session_locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn confirm(&self, actor: Uuid, id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        let session = self.load(id).await?;
        let next = session::check_transition(&session, SessionAction::Confirm, Actor::User(actor), now)?;

        let ledger = self.ledger.clone();
        let (student, teacher, cost) = (session.student_id, session.teacher_id, session.cost());
        let reservation = self
            .blocking(move || ledger.reserve(student, teacher, cost, id))
            .await?;

        let updated = Session {
            status: next,
            reservation_id: Some(reservation),
            updated_at: now,
            ..session
        };
        if let Err(e) = self.save(&updated).await {
            // Undo the reservation so no pending transfer outlives a failed confirm
            if let Err(undo) = self.cancel_reservation(reservation).await {
                error!(
                    "Reservation {} for session {} left pending after failed confirm: {}",
                    reservation, id, undo
                );
            }
            return Err(e);
        }

        info!("Session {} confirmed ({} credits reserved)", id, cost);
        self.notify(&updated);
        Ok(updated)
    }

    async fn cancel(&self, actor: Actor, id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        let session = self.load(id).await?;
        let next = session::check_transition(&session, SessionAction::Cancel, actor, now)?;

        self.release_reservations(&session).await?;

        let updated = Session {
            status: next,
            updated_at: now,
            ..session
        };
        with_retry(self.config.retry, "session save", || self.save(&updated)).await?;

        info!("Session {} cancelled by {:?}", id, actor);
        self.notify(&updated);
        Ok(updated)
    }

    async fn complete(&self, actor: Actor, id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        let session = self.load(id).await?;
        let next = session::check_transition(&session, SessionAction::Complete, actor, now)?;
        let reservation = session.reservation_id.ok_or_else(|| {
            BookingError::Internal(format!("confirmed session {} has no reservation", id))
        })?;

        // A previous attempt may have moved the reservation before failing to
        // save the session
        let ledger = self.ledger.clone();
        let current = self.blocking(move || ledger.get(reservation)).await?;
        match current.status {
            TransactionStatus::Completed => {}
            TransactionStatus::Pending => {
                let ledger = self.ledger.clone();
                with_retry(self.config.retry, "ledger commit", || {
                    let ledger = ledger.clone();
                    self.blocking(move || ledger.commit(reservation))
                })
                .await?;
            }
            TransactionStatus::Cancelled => {
                // The release happened but the cancelled session was never saved
                warn!(
                    "Session {} still confirmed with cancelled reservation {}, finishing the cancel",
                    id, reservation
                );
                let cancelled = Session {
                    status: SessionStatus::Cancelled,
                    updated_at: now,
                    ..session
                };
                with_retry(self.config.retry, "session save", || self.save(&cancelled)).await?;
                self.notify(&cancelled);
                return Err(BookingError::InvalidStateTransition {
                    entity: "session",
                    from: SessionStatus::Cancelled.as_str(),
                    action: SessionAction::Complete.as_str(),
                });
            }
        }

        let updated = Session {
            status: next,
            updated_at: now,
            ..session
        };
        with_retry(self.config.retry, "session save", || self.save(&updated)).await?;

        info!("Session {} completed ({} credits transferred)", id, current.amount);
        self.notify(&updated);
        Ok(updated)
    }

    async fn reschedule(
        &self,
        actor: Uuid,
        id: Uuid,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = self.load(id).await?;
        let next = session::check_transition(&session, SessionAction::Reschedule, Actor::User(actor), now)?;
        session::validate_reschedule(scheduled_start, scheduled_end, now, self.config.reschedule_buffer)?;

        let updated = Session {
            status: next,
            scheduled_start: session::storable(scheduled_start),
            scheduled_end: session::storable(scheduled_end),
            updated_at: now,
            ..session
        };
        self.save(&updated).await?;

        info!("Session {} rescheduled to {}", id, scheduled_start);
        self.notify(&updated);
        Ok(updated)
    }

    /// Cancel the recorded reservation plus any pending transfer an
    /// interrupted confirm left for the session.
    async fn release_reservations(&self, session: &Session) -> Result<()> {
        let ledger = self.ledger.clone();
        let id = session.id;
        let live = self.blocking(move || ledger.live_for_session(id)).await?;

        let mut reservations: Vec<Uuid> = session.reservation_id.into_iter().collect();
        if let Some(tx) =
            live.filter(|tx| tx.status == TransactionStatus::Pending && !reservations.contains(&tx.id))
        {
            reservations.push(tx.id);
        }
        for reservation in reservations {
            self.cancel_reservation(reservation).await?;
        }
        Ok(())
    }

    async fn cancel_reservation(&self, reservation: Uuid) -> Result<()> {
        let ledger = self.ledger.clone();
        with_retry(self.config.retry, "ledger cancel", || {
            let ledger = ledger.clone();
            self.blocking(move || ledger.cancel(reservation))
        })
        .await
        .map(|_| ())
    }

    async fn load(&self, id: Uuid) -> Result<Session> {
        let db = self.db.clone();
        self.blocking(move || {
            db.get_session(id)?
                .ok_or_else(|| BookingError::NotFound(format!("session {}", id)))
        })
        .await
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let db = self.db.clone();
        let session = session.clone();
        self.blocking(move || Ok(db.update_session(&session)?)).await
    }

    /// Best-effort push to both participants. Never fails the transition.
    fn notify(&self, session: &Session) {
        let delivered = self.router.route_to_many(
            NotificationEvent::SessionUpdated(session.clone()),
            [session.student_id, session.teacher_id],
        );
        if delivered == 0 {
            debug!("Session {} update reached no live connection", session.id);
        }
    }
}
