//! Error taxonomy and JSON error responses for the preview host

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors produced by the preview host core
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// Every port in the configured range is taken or refuses a bind probe
    #[error("no ports available in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    /// The backing listener or process did not come up
    #[error("failed to launch instance for app '{app_id}': {cause}")]
    LaunchFailed { app_id: String, cause: String },

    /// Capacity is full and no victim could be torn down
    #[error("eviction failed: {reason}")]
    EvictionFailed { reason: String },

    /// Stopping a listener or process did not complete
    #[error("failed to tear down instance for app '{app_id}': {cause}")]
    TeardownFailed { app_id: String, cause: String },

    /// No live instance and nothing to rehydrate from
    #[error("app '{app_id}' not found")]
    NotFound { app_id: String },

    /// The stored definition is past its expiry
    #[error("app '{app_id}' has expired")]
    Expired { app_id: String },

    /// Reclaim raced with another reclaim or found nothing to do
    #[error("app '{app_id}' already reclaimed")]
    AlreadyReclaimed { app_id: String },

    /// The creation request is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The creation request exceeds the payload limit
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The app store failed
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PreviewError {
    pub fn launch_failed(app_id: &str, cause: impl std::fmt::Display) -> Self {
        PreviewError::LaunchFailed {
            app_id: app_id.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Error code used in JSON envelopes and the X-Proxy-Error header
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            PreviewError::NoPortsAvailable { .. } => ProxyErrorCode::NoPortsAvailable,
            PreviewError::LaunchFailed { .. } => ProxyErrorCode::LaunchFailed,
            PreviewError::EvictionFailed { .. } => ProxyErrorCode::EvictionFailed,
            PreviewError::TeardownFailed { .. } => ProxyErrorCode::InternalError,
            PreviewError::NotFound { .. } => ProxyErrorCode::NotFound,
            PreviewError::Expired { .. } => ProxyErrorCode::Expired,
            PreviewError::AlreadyReclaimed { .. } => ProxyErrorCode::NotFound,
            PreviewError::InvalidRequest(_) => ProxyErrorCode::InvalidRequest,
            PreviewError::PayloadTooLarge { .. } => ProxyErrorCode::PayloadTooLarge,
            PreviewError::Storage(_) => ProxyErrorCode::InternalError,
        }
    }

    /// Human-readable message that is safe to show to the creator of an app
    pub fn public_message(&self) -> &'static str {
        match self {
            PreviewError::NoPortsAvailable { .. } => "Preview capacity exhausted, try again later",
            PreviewError::LaunchFailed { .. } => "Preview instance failed to start",
            PreviewError::EvictionFailed { .. } => "Preview capacity is full and no instance could be freed",
            PreviewError::TeardownFailed { .. } => "Preview instance could not be stopped",
            PreviewError::NotFound { .. } | PreviewError::AlreadyReclaimed { .. } => "Preview not found",
            PreviewError::Expired { .. } => "Preview has expired",
            PreviewError::InvalidRequest(_) => "Invalid preview request",
            PreviewError::PayloadTooLarge { .. } => "Preview payload too large",
            PreviewError::Storage(_) => "Preview storage unavailable",
        }
    }

    /// True for routing misses that should surface as 404
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            PreviewError::NotFound { .. }
                | PreviewError::Expired { .. }
                | PreviewError::AlreadyReclaimed { .. }
        )
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Path does not name a preview or the preview is gone
    NotFound,
    /// Preview exists in storage but is past its TTL
    Expired,
    /// Port range exhausted
    NoPortsAvailable,
    /// Capacity full and eviction did not succeed
    EvictionFailed,
    /// Backing instance failed to start
    LaunchFailed,
    /// Malformed creation request
    InvalidRequest,
    /// Request or payload too large
    PayloadTooLarge,
    /// Missing or wrong admin token
    Unauthorized,
    /// Request timed out waiting for the instance
    RequestTimeout,
    /// Failed to connect to the instance
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::Expired => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoPortsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::EvictionFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::LaunchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::Expired => "EXPIRED",
            ProxyErrorCode::NoPortsAvailable => "NO_PORTS_AVAILABLE",
            ProxyErrorCode::EvictionFailed => "EVICTION_FAILED",
            ProxyErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Underlying cause, only filled in for creation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.code.status_code();
        let header = self.code.as_header_value();
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Proxy-Error", header)
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(code, message).into_response()
}

/// Error response for a failed creation request: public message plus cause
pub fn creation_error_response(err: &PreviewError) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(err.code(), err.public_message())
        .with_cause(err.to_string())
        .into_response()
}

/// Error response for a routing failure: public message only
pub fn routing_error_response(err: &PreviewError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(err.code(), err.public_message())
}
