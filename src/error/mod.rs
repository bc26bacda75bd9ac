use actix_web::{HttpResponse, error::ResponseError, http::StatusCode};
use serde::{Deserialize, Serialize};
use sqlx::error::Error as SqlxError;
use std::error::Error as StdError;
use std::fmt;

use crate::models::billing::PurchaseHint;

#[derive(Debug)]
pub enum AppError {
    Database(String),
    Internal(String),
    Configuration(String),
    Validation(String),
    NotFound(String),
    AccountNotFound(String),
    AccountSuspended(String),
    AccountClosed(String),
    InsufficientCredits {
        message: String,
        hint: Option<PurchaseHint>,
    },
    IdempotencyConflict(String),
    WriteVerification(String),
    DataIntegrity(String),
    SignatureInvalid(String),
    PaymentProvider(String),
    ServiceUnavailable(String),
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<serde_json::Value>,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AppError::Validation(e) => write!(f, "Validation error: {}", e),
            AppError::NotFound(e) => write!(f, "Not found: {}", e),
            AppError::AccountNotFound(e) => write!(f, "Account not found: {}", e),
            AppError::AccountSuspended(e) => write!(f, "Account suspended: {}", e),
            AppError::AccountClosed(e) => write!(f, "Account closed: {}", e),
            AppError::InsufficientCredits { message, .. } => {
                write!(f, "Insufficient credits: {}", message)
            }
            AppError::IdempotencyConflict(e) => write!(f, "Idempotency conflict: {}", e),
            AppError::WriteVerification(e) => write!(f, "Write verification failed: {}", e),
            AppError::DataIntegrity(e) => write!(f, "Data integrity error: {}", e),
            AppError::SignatureInvalid(e) => write!(f, "Signature invalid: {}", e),
            AppError::PaymentProvider(e) => write!(f, "Payment provider error: {}", e),
            AppError::ServiceUnavailable(e) => write!(f, "Service unavailable: {}", e),
        }
    }
}

impl StdError for AppError {}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
            AppError::AccountSuspended(_) => (StatusCode::FORBIDDEN, "account_suspended"),
            AppError::AccountClosed(_) => (StatusCode::FORBIDDEN, "account_closed"),
            AppError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            AppError::IdempotencyConflict(_) => (StatusCode::CONFLICT, "idempotency_conflict"),
            AppError::WriteVerification(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "write_verification_failure")
            }
            AppError::DataIntegrity(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "data_integrity_error")
            }
            AppError::SignatureInvalid(_) => (StatusCode::BAD_REQUEST, "signature_invalid"),
            AppError::PaymentProvider(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "payment_provider_error")
            }
            AppError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        }
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::InsufficientCredits { hint: Some(hint), .. } => serde_json::json!({
                "purchase_required": true,
                "purchase_price_minor": hint.price_minor,
                "purchase_uses": hint.uses,
            })
            .into(),
            _ => None,
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status_code, error_type) = self.status_and_type();

        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: self.to_string(),
            error_type: error_type.to_string(),
            error_details: self.error_details(),
        };

        HttpResponse::build(status_code).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        self.status_and_type().0
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::PoolTimedOut | SqlxError::PoolClosed => {
                AppError::ServiceUnavailable(error.to_string())
            }
            SqlxError::Io(e) => AppError::ServiceUnavailable(e.to_string()),
            _ => AppError::Database(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!(
            "JSON deserialization/serialization error: {}",
            error
        ))
    }
}

impl From<crate::services::payment::PaymentGatewayError> for AppError {
    fn from(error: crate::services::payment::PaymentGatewayError) -> Self {
        use crate::services::payment::PaymentGatewayError;
        match error {
            PaymentGatewayError::SignatureInvalid(msg) => AppError::SignatureInvalid(msg),
            PaymentGatewayError::Api(msg) => AppError::PaymentProvider(msg),
            PaymentGatewayError::Configuration(msg) => AppError::Configuration(msg),
            PaymentGatewayError::Unsupported(msg) => AppError::PaymentProvider(msg),
        }
    }
}

// Define AppResult type alias for Result<T, AppError>
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validation_maps_to_422() {
        let err = AppError::Validation("bad body".to_string());
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn insufficient_credits_maps_to_402_with_hint() {
        let err = AppError::InsufficientCredits {
            message: "no credits remaining".to_string(),
            hint: Some(PurchaseHint {
                price_minor: 500,
                uses: 50,
            }),
        };
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        let details = err.error_details().expect("details");
        assert_eq!(details["purchase_price_minor"], 500);
        assert_eq!(details["purchase_uses"], 50);
        assert_eq!(details["purchase_required"], true);
    }

    #[test]
    fn status_errors_map_to_403() {
        assert_eq!(
            AppError::AccountSuspended("u1".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::AccountClosed("u1".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn pool_exhaustion_surfaces_as_service_unavailable() {
        let err: AppError = SqlxError::PoolTimedOut.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn write_verification_maps_to_500() {
        let err = AppError::WriteVerification("balance mismatch".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
