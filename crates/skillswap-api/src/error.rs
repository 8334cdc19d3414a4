use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use skillswap_booking::BookingError;
use skillswap_types::api::ErrorResponse;

/// JSON error body with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        let (status, code) = match &err {
            BookingError::InsufficientBalance { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_balance")
            }
            BookingError::InvalidStateTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_state_transition")
            }
            BookingError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            BookingError::Unauthorized(_) => (StatusCode::FORBIDDEN, "unauthorized"),
            BookingError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            BookingError::TransientStore(_) => (StatusCode::SERVICE_UNAVAILABLE, "try_again"),
            BookingError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        // Internals stay in the log, not in the response
        let message = if let BookingError::Internal(detail) = &err {
            error!("Internal error: {}", detail);
            "internal server error".to_string()
        } else {
            err.to_string()
        };

        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn booking_errors_map_to_statuses() {
        let cases = [
            (
                BookingError::InsufficientBalance {
                    user_id: Uuid::new_v4(),
                    balance: 5,
                    required: 20,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BookingError::InvalidStateTransition {
                    entity: "session",
                    from: "cancelled",
                    action: "confirm",
                },
                StatusCode::CONFLICT,
            ),
            (BookingError::NotFound("session".into()), StatusCode::NOT_FOUND),
            (BookingError::Unauthorized("no".into()), StatusCode::FORBIDDEN),
            (BookingError::Validation("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (BookingError::TransientStore("busy".into()), StatusCode::SERVICE_UNAVAILABLE),
            (BookingError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = ApiError::from(BookingError::Internal("sqlite exploded at /var/db".into()));
        assert_eq!(err.message, "internal server error");

        let err = ApiError::from(BookingError::Validation("session must start before it ends".into()));
        assert!(err.message.contains("start before it ends"));
    }
}
