use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use skillswap_api::auth::{self, AppState};
use skillswap_api::middleware::{decode_token, require_auth};
use skillswap_api::{credits, messages, presence, sessions};
use skillswap_gateway::connection;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/sessions/{session_id}", get(sessions::get_session))
        .route("/sessions/{session_id}/confirm", post(sessions::confirm_session))
        .route("/sessions/{session_id}/cancel", post(sessions::cancel_session))
        .route("/sessions/{session_id}/complete", post(sessions::complete_session))
        .route("/sessions/{session_id}/reschedule", post(sessions::reschedule_session))
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/messages", post(messages::send_message))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route("/conversations/{peer_id}/messages", get(messages::get_conversation))
        .route("/presence/online", get(presence::list_online))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Browsers cannot set headers on a WebSocket handshake, so the token rides
/// in the query string.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(claims) = query
        .token
        .as_deref()
        .and_then(|token| decode_token(&state.jwt_secret, token))
    else {
        debug!("Rejected gateway upgrade with missing or invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let registry = state.registry.clone();
    let identity = claims.identity();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, registry, identity))
        .into_response()
}
