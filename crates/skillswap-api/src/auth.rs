use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info, warn};
use uuid::Uuid;

use skillswap_booking::{BookingError, BookingService};
use skillswap_db::{Database, is_unique_violation};
use skillswap_gateway::{ConnectionRegistry, GroupRouter};
use skillswap_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub registry: ConnectionRegistry,
    pub router: GroupRouter,
    pub booking: Arc<BookingService>,
    /// Credits granted from the system account on registration.
    pub signup_credits: i64,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let name = req.name.trim().to_string();

    if !email.contains('@') || email.len() > 254 {
        return Err(ApiError::validation("invalid email address"));
    }
    if name.is_empty() || name.chars().count() > 64 {
        return Err(ApiError::validation("name must be 1-64 characters"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }

    let db = state.db.clone();
    let ledger = state.booking.ledger().clone();
    let signup_credits = state.signup_credits;
    let user_id = Uuid::new_v4();
    let (stored_name, stored_email) = (name.clone(), email.clone());

    // The UNIQUE email column decides races between registrations, and a
    // failed grant removes the user again so no account exists without it
    let balance = state
        .booking
        .blocking(move || {
            // Hash password with Argon2id
            let salt = SaltString::generate(&mut OsRng);
            let password_hash = Argon2::default()
                .hash_password(req.password.as_bytes(), &salt)
                .map_err(|e| BookingError::Internal(e.to_string()))?
                .to_string();

            let id = user_id.to_string();
            match db.create_user(&id, &stored_email, &stored_name, &password_hash) {
                Ok(()) => {}
                Err(e) if is_unique_violation(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let granted = if signup_credits > 0 {
                ledger.grant(user_id, signup_credits).map(|_| ())
            } else {
                Ok(())
            };
            if let Err(e) = granted {
                match db.delete_user(&id) {
                    Ok(_) => warn!("Registration of {} rolled back: {}", stored_email, e),
                    Err(undo) => error!(
                        "User {} left without signup credits: {} (rollback failed: {})",
                        id, e, undo
                    ),
                }
                return Err(e);
            }
            ledger.balance(user_id).map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::CONFLICT, "conflict", "email already registered"))?;

    let token = create_token(&state.jwt_secret, user_id, &email, &name)
        .map_err(|e| ApiError::from(BookingError::Internal(e.to_string())))?;

    info!("Registered user {} with {} credits", user_id, balance);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id,
            token,
            balance,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let unauthorized = || ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid credentials");

    let db = state.db.clone();
    let email = req.email.trim().to_lowercase();
    let user = state
        .booking
        .blocking(move || Ok(db.get_user_by_email(&email)?))
        .await?
        .ok_or_else(unauthorized)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ApiError::from(BookingError::Internal(e.to_string())))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| unauthorized())?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|_| ApiError::from(BookingError::Internal(format!("bad user id {}", user.id))))?;

    let token = create_token(&state.jwt_secret, user_id, &user.email, &user.display_name)
        .map_err(|e| ApiError::from(BookingError::Internal(e.to_string())))?;

    Ok(Json(LoginResponse {
        user_id,
        name: user.display_name,
        token,
    }))
}

pub(crate) fn create_token(
    secret: &str,
    user_id: Uuid,
    email: &str,
    name: &str,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        name: name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
