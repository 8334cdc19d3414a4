use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use skillswap_booking::{Actor, NewSession};
use skillswap_types::api::{Claims, CreateSessionRequest, RescheduleSessionRequest};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn create_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = NewSession {
        teacher_id: req.teacher_id,
        skill_id: req.skill_id,
        scheduled_start: req.scheduled_start,
        scheduled_end: req.scheduled_end,
        credits_per_hour: req.credits_per_hour,
    };

    // The teacher must exist before anyone books them
    let db = state.db.clone();
    let teacher = req.teacher_id.to_string();
    let known = state
        .booking
        .blocking(move || Ok(db.get_user_by_id(&teacher)?.is_some()))
        .await?;
    if !known {
        return Err(ApiError::not_found(format!("user {}", req.teacher_id)));
    }

    let session = state
        .booking
        .create_session(claims.sub, request, Utc::now())
        .await?;

    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.booking.list_sessions(claims.sub).await?;
    Ok(Json(sessions))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.booking.get_session(claims.sub, session_id).await?;
    Ok(Json(session))
}

pub async fn confirm_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .booking
        .confirm_session(claims.sub, session_id, Utc::now())
        .await?;
    Ok(Json(session))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .booking
        .cancel_session(Actor::User(claims.sub), session_id, Utc::now())
        .await?;
    Ok(Json(session))
}

pub async fn complete_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .booking
        .complete_session(Actor::User(claims.sub), session_id, Utc::now())
        .await?;
    Ok(Json(session))
}

pub async fn reschedule_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<RescheduleSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .booking
        .reschedule_session(
            claims.sub,
            session_id,
            req.scheduled_start,
            req.scheduled_end,
            Utc::now(),
        )
        .await?;
    Ok(Json(session))
}
