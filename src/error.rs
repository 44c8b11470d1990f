//! Error taxonomy (spec.md §7). `StoreError` is the ledger store's typed
//! boundary; `ApiError` is the HTTP boundary and hides internals from the
//! response body, logging the low-level cause instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("login already exists")]
    AlreadyExists,
    #[error("insufficient bonus balance")]
    InsufficientFunds,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("malformed request body")]
    BadRequest,
    #[error("wrong content type")]
    WrongContentType,
    #[error("missing or malformed authorization token")]
    Unauthorized,
    #[error("caller lacks required role")]
    Forbidden,
    #[error("login already exists")]
    LoginTaken,
    #[error("order already submitted by another user")]
    OrderOwnedByAnother,
    #[error("order number fails Luhn validation")]
    InvalidOrderNumber,
    #[error("insufficient bonus balance")]
    InsufficientFunds,
    #[error("bad credentials")]
    BadCredentials,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists => ApiError::LoginTaken,
            StoreError::InsufficientFunds => ApiError::InsufficientFunds,
            StoreError::Db(e) => ApiError::Internal(anyhow::anyhow!(e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::WrongContentType => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized | ApiError::BadCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::LoginTaken | ApiError::OrderOwnedByAnother => StatusCode::CONFLICT,
            ApiError::InvalidOrderNumber => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal error serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return (status, Json(json!({"error": "internal server error"}))).into_response();
        }

        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

/// Parses a raw request body into `T`, mapping a parse failure onto
/// `ApiError::BadRequest` (spec.md §6/§7, "400 bad JSON") — the one site
/// that actually constructs that variant, used by handlers that take the
/// body as `axum::body::Bytes` instead of axum's own `Json<T>` extractor so
/// malformed JSON produces this taxonomy's response instead of axum's
/// default plain-text rejection body.
pub fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest)
}
