use axum::{Extension, Json, extract::State, response::IntoResponse};

use skillswap_types::api::Claims;

use crate::auth::AppState;

/// Users with at least one live gateway connection, the caller excluded.
pub async fn list_online(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    Json(state.registry.list_online(claims.sub))
}
