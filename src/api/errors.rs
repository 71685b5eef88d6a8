//! API Error Handling
//!
//! JSON error bodies of the form `{"error": "...", "code": "..."}` with proper
//! HTTP status codes and request tracking.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Error code (RATE_LIMITED, UNAUTHORIZED, NOT_FOUND, ...)
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// API error types with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    TooManyRequests {
        limit: u32,
        window_secs: u64,
        retry_after_secs: u64,
    },
    Unauthorized(String),
    NotFound(String),
}

impl ApiError {
    pub fn too_many_requests(
        request_id: Option<String>,
        limit: u32,
        window_secs: u64,
        retry_after_secs: u64,
    ) -> Self {
        Self {
            kind: ApiErrorKind::TooManyRequests {
                limit,
                window_secs,
                retry_after_secs,
            },
            request_id,
        }
    }

    pub fn unauthorized(request_id: Option<String>, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message),
            request_id,
        }
    }

    pub fn not_found(request_id: Option<String>, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    fn message(&self) -> String {
        match &self.kind {
            ApiErrorKind::TooManyRequests {
                limit, window_secs, ..
            } => format!(
                "Too many requests. Your limits are currently {} requests per {} seconds.",
                limit, window_secs
            ),
            ApiErrorKind::Unauthorized(msg) | ApiErrorKind::NotFound(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request_id {
            Some(id) => write!(f, "[{}] {}", id, self.message()),
            None => write!(f, "{}", self.message()),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.message();
        let (status, code, retry_after) = match &self.kind {
            ApiErrorKind::TooManyRequests {
                retry_after_secs, ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                Some(*retry_after_secs),
            ),
            ApiErrorKind::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            ApiErrorKind::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
            retry_after,
            request_id: self.request_id,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
