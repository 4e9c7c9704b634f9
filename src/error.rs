//! Error taxonomy and JSON error responses for the gateway

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Client-visible error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed identifier, path, or capacity value
    InvalidArgument,
    /// Admission window exceeded
    RateLimited,
    /// Duplicate active job for a block id
    Conflict,
    /// No workers, all workers busy, or coordinator unreachable
    Unavailable,
    /// Unknown job or worker
    NotFound,
    /// RPC deadline exceeded
    Timeout,
    /// Remote call cancelled
    Cancelled,
    /// Endpoint exists but is not implemented
    NotImplemented,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Errors that can reach an HTTP client.
///
/// Messages carried here are already safe to show: upstream errors are
/// sanitized before they are wrapped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Too many requests: limit is {limit} per {}s, retry in {}s", window.as_secs(), retry_after_secs(*retry_after))]
    RateLimited {
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    NotFound(String),

    #[error(
        "Coordinator call '{method}' timed out after {}ms. Check that the coordinator is running and reachable, and that at least one worker is connected and idle.",
        timeout.as_millis()
    )]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::Conflict(_) => ErrorCode::Conflict,
            GatewayError::Unavailable(_) => ErrorCode::Unavailable,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::Timeout { .. } => ErrorCode::Timeout,
            GatewayError::Cancelled(_) => ErrorCode::Cancelled,
            GatewayError::NotImplemented(_) => ErrorCode::NotImplemented,
            GatewayError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        GatewayError::InvalidArgument(message.into())
    }

    /// Convert to a JSON error response with the X-Gateway-Error header
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let code = self.code();
        let mut body = ErrorResponse::new(code, self.to_string());
        let mut builder = Response::builder()
            .status(code.status_code())
            .header("Content-Type", "application/json")
            .header("X-Gateway-Error", code.as_header_value());

        if let GatewayError::RateLimited { retry_after, .. } = &self {
            body.retry_after_ms = Some(retry_after.as_millis() as u64);
            builder = builder.header("Retry-After", retry_after_secs(*retry_after).to_string());
        }

        builder
            .body(Full::new(Bytes::from(body.to_json())))
            .expect("valid response with StatusCode enum and static headers")
    }
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub error: String,
    /// HTTP status code (for reference)
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
            retry_after_ms: None,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }
}
