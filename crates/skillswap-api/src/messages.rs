use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use skillswap_types::api::{Claims, SendMessageRequest};
use skillswap_types::events::NotificationEvent;
use skillswap_types::models::DirectMessage;

use crate::auth::AppState;
use crate::error::ApiError;

const MAX_BODY_CHARS: usize = 4000;
const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub limit: Option<u32>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let body = req.body.trim().to_string();
    if body.is_empty() || body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::validation(format!(
            "message body must be 1-{MAX_BODY_CHARS} characters"
        )));
    }
    if req.recipient_id == claims.sub {
        return Err(ApiError::validation("cannot message yourself"));
    }

    let message = DirectMessage {
        id: Uuid::new_v4(),
        sender_id: claims.sub,
        recipient_id: req.recipient_id,
        body,
        created_at: Utc::now(),
        read_at: None,
    };

    let db = state.db.clone();
    let stored = message.clone();
    let summaries = state
        .booking
        .blocking(move || {
            if db.get_user_by_id(&stored.recipient_id.to_string())?.is_none() {
                return Ok(None);
            }
            db.insert_message(&stored)?;
            let for_sender = db.conversation_summary(stored.sender_id, stored.recipient_id)?;
            let for_recipient = db.conversation_summary(stored.recipient_id, stored.sender_id)?;
            Ok(Some((for_sender, for_recipient)))
        })
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {}", req.recipient_id)))?;

    let delivered = state.router.route(
        NotificationEvent::MessageReceived(message.clone()),
        message.recipient_id,
    );
    debug!("Message {} delivered to {} connections", message.id, delivered);

    let (for_sender, for_recipient) = summaries;
    if let Some(summary) = for_recipient {
        state
            .router
            .route(NotificationEvent::ConversationUpdated(summary), message.recipient_id);
    }
    if let Some(summary) = for_sender {
        state
            .router
            .route(NotificationEvent::ConversationUpdated(summary), message.sender_id);
    }

    Ok((StatusCode::CREATED, Json(message)))
}

/// Messages between the caller and `peer_id`, newest first.
pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<ConversationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let db = state.db.clone();
    let user_id = claims.sub;

    let messages = state
        .booking
        .blocking(move || Ok(db.conversation(user_id, peer_id, limit)?))
        .await?;

    Ok(Json(messages))
}

/// Mark a received message read and tell its sender. Repeating it is a no-op.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let message = state
        .booking
        .blocking(move || Ok(db.get_message(message_id)?))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("message {message_id}")))?;

    if message.recipient_id != claims.sub {
        return Err(ApiError::forbidden("only the recipient can mark a message read"));
    }
    if message.read_at.is_some() {
        return Ok(Json(message));
    }

    let read_at = Utc::now();
    let db = state.db.clone();
    let (sender_id, reader_id) = (message.sender_id, message.recipient_id);
    let (changed, summary) = state
        .booking
        .blocking(move || {
            let changed = db.mark_message_read(message_id, read_at)?;
            let summary = db.conversation_summary(reader_id, sender_id)?;
            Ok((changed, summary))
        })
        .await?;

    if changed {
        state
            .router
            .route(NotificationEvent::MessageRead { message_id, read_at }, sender_id);
        if let Some(summary) = summary {
            state
                .router
                .route(NotificationEvent::ConversationUpdated(summary), reader_id);
        }
    }

    let db = state.db.clone();
    let message = state
        .booking
        .blocking(move || Ok(db.get_message(message_id)?))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("message {message_id}")))?;

    Ok(Json(message))
}
