//! Booking lifecycle: `Pending -> Confirmed -> Completed`, with `Cancelled`
//! reachable from either open state.
//!
//! Everything here is pure: checks run against a snapshot of the session
//! before any ledger or storage call, so a rejected action never mutates
//! anything.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use uuid::Uuid;

use skillswap_types::models::{Session, SessionStatus};

use crate::error::{BookingError, Result};

/// Who is driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(Uuid),
    /// Background sweeper acting on timeouts and elapsed sessions
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Confirm,
    Cancel,
    Complete,
    Reschedule,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Reschedule => "reschedule",
        }
    }
}

/// Student-supplied booking request.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub teacher_id: Uuid,
    pub skill_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub credits_per_hour: i64,
}

/// Build a `Pending` session, validating the request.
pub fn new_session(student_id: Uuid, req: NewSession, now: DateTime<Utc>) -> Result<Session> {
    if student_id == req.teacher_id {
        return Err(BookingError::Validation(
            "cannot book a session with yourself".into(),
        ));
    }
    if req.credits_per_hour < 1 {
        return Err(BookingError::Validation(
            "credits per hour must be at least 1".into(),
        ));
    }
    let (start, end, now) = (storable(req.scheduled_start), storable(req.scheduled_end), storable(now));
    validate_schedule(start, end, now)?;

    Ok(Session {
        id: Uuid::new_v4(),
        student_id,
        teacher_id: req.teacher_id,
        skill_id: req.skill_id,
        scheduled_start: start,
        scheduled_end: end,
        status: SessionStatus::Pending,
        credits_per_hour: req.credits_per_hour,
        reservation_id: None,
        created_at: now,
        updated_at: now,
    })
}

/// Millisecond precision, matching what storage keeps.
pub fn storable(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(3)
}

/// `start < end`, and `start` strictly after `earliest_start`.
pub fn validate_schedule(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    earliest_start: DateTime<Utc>,
) -> Result<()> {
    if start >= end {
        return Err(BookingError::Validation(
            "session must start before it ends".into(),
        ));
    }
    if start <= earliest_start {
        return Err(BookingError::Validation(format!(
            "session must start after {}",
            earliest_start.to_rfc3339()
        )));
    }
    Ok(())
}

/// Reschedules must keep a minimum lead time from now.
pub fn validate_reschedule(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    buffer: Duration,
) -> Result<()> {
    if start < now + buffer {
        return Err(BookingError::Validation(format!(
            "rescheduled session must start at least {} minutes from now",
            buffer.num_minutes()
        )));
    }
    validate_schedule(start, end, now)
}

/// The status an action leads to, or `None` if it is not allowed from `from`.
pub fn next_status(from: SessionStatus, action: SessionAction) -> Option<SessionStatus> {
    use SessionAction::*;
    use SessionStatus::*;

    match (from, action) {
        (Pending, Confirm) => Some(Confirmed),
        (Pending | Confirmed, Cancel) => Some(Cancelled),
        (Confirmed, Complete) => Some(Completed),
        (Pending | Confirmed, Reschedule) => Some(from),
        _ => None,
    }
}

/// Check that `actor` may perform `action` on `session` at `now`. Returns
/// the resulting status.
pub fn check_transition(
    session: &Session,
    action: SessionAction,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<SessionStatus> {
    authorize(session, action, actor)?;

    let next = next_status(session.status, action).ok_or(BookingError::InvalidStateTransition {
        entity: "session",
        from: session.status.as_str(),
        action: action.as_str(),
    })?;

    if action == SessionAction::Complete && now < session.scheduled_end {
        return Err(BookingError::Validation(
            "session cannot be completed before its scheduled end".into(),
        ));
    }

    Ok(next)
}

fn authorize(session: &Session, action: SessionAction, actor: Actor) -> Result<()> {
    let allowed = match (action, actor) {
        (_, Actor::User(user_id)) if !session.is_participant(user_id) => false,
        (SessionAction::Confirm, Actor::User(user_id)) => user_id == session.teacher_id,
        (SessionAction::Confirm, Actor::System) => false,
        (SessionAction::Cancel, _) => true,
        (SessionAction::Complete, Actor::User(user_id)) => user_id == session.teacher_id,
        (SessionAction::Complete, Actor::System) => true,
        (SessionAction::Reschedule, Actor::User(_)) => true,
        (SessionAction::Reschedule, Actor::System) => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(BookingError::Unauthorized(format!(
            "only {} may {} this session",
            match action {
                SessionAction::Confirm | SessionAction::Complete => "the teacher",
                SessionAction::Cancel | SessionAction::Reschedule => "a participant",
            },
            action.as_str()
        )))
    }
}
