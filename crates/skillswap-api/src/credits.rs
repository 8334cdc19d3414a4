use axum::{Extension, Json, extract::State, response::IntoResponse};

use skillswap_types::api::{BalanceResponse, Claims};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.booking.ledger().clone();
    let user_id = claims.sub;
    let balance = state.booking.blocking(move || ledger.balance(user_id)).await?;

    Ok(Json(BalanceResponse { user_id, balance }))
}

/// Every transaction the caller sent or received, newest first.
pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.booking.ledger().clone();
    let user_id = claims.sub;
    let transactions = state
        .booking
        .blocking(move || ledger.transactions_for(user_id))
        .await?;

    Ok(Json(transactions))
}
