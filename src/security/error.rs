// Rejection taxonomy shared by every admission stage
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use log::error;
use serde_json::json;
use thiserror::Error;

use crate::security::auth::BearerError;
use crate::storage::StoreError;

/// Backoff hint returned with every rate-limit rejection.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Why a request failed authentication. Kept distinct for audit quality; the
/// caller only ever sees "unauthorized" or "request expired".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthFailure {
    #[error("bearer credential rejected: {0}")]
    Bearer(#[from] BearerError),
    #[error("unknown or expired credential")]
    InvalidCredential,
    #[error("request expired")]
    RequestExpired,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("signed request required")]
    SignatureRequired,
    #[error("invalid admin token")]
    InvalidAdminToken,
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthFailure),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self {
        GateError::Internal(e.to_string())
    }
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GateError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GateError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Never carries storage details.
    pub fn public_message(&self) -> &'static str {
        match self {
            GateError::MalformedRequest(_) => "malformed request",
            GateError::Unauthenticated(AuthFailure::RequestExpired) => "request expired",
            GateError::Unauthenticated(_) => "unauthorized",
            GateError::RateLimited => "rate limit exceeded",
            GateError::Internal(_) => "internal error",
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        if let GateError::Internal(detail) = &self {
            error!("❌ Internal error during admission: {}", detail);
        }

        let mut response =
            (self.status(), Json(json!({ "error": self.public_message() }))).into_response();

        if matches!(self, GateError::RateLimited) {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }

        response
    }
}
