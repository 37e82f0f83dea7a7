//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures raised by container lifecycle operations and the nursery.
///
/// Backend stop/kill failures are deliberately absent: the container
/// implementations log and swallow them, so a half-dead backend can never
/// abort a retirement pass.
#[derive(Debug, Error)]
pub enum GateError {
    /// Image reference without a `scheme://` prefix.
    #[error("image '{0}' is not prefixed with scheme://")]
    MissingScheme(String),

    /// No protocol sub-factory registered for the image's scheme.
    #[error("no container factory registered for scheme '{0}'")]
    UnknownScheme(String),

    /// Backend never answered its readiness probe within the start budget.
    #[error("backend on port {port} did not become ready within {budget_ms} ms")]
    ReadinessTimeout { port: u16, budget_ms: u64 },

    /// A bounded lifecycle operation overran its budget and the container
    /// was killed.
    #[error("{op} exceeded its {budget_ms} ms budget")]
    OperationTimeout { op: &'static str, budget_ms: u64 },

    /// Bytes failed to move between proxy and backend mid-request.
    #[error("backend transport failure: {0}")]
    Transport(String),

    /// Anything the container runtime reported that has no dedicated variant.
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl GateError {
    /// True for errors caused by the route's configuration rather than the
    /// backend's behavior.
    pub fn is_configuration(&self) -> bool {
        matches!(self, GateError::MissingScheme(_) | GateError::UnknownScheme(_))
    }
}

/// Error codes surfaced on the HTTP forwarder
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request identity matches no configured route
    RouteNotFound,
    /// Missing or invalid Host header in request
    MissingHostHeader,
    /// Route configuration prevents constructing a container
    ConfigurationError,
    /// Container failed to start or become ready
    StartFailed,
    /// Request exceeded its budget waiting for the backend
    RequestTimeout,
    /// Failed to relay the request to the backend
    ProxyFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::StartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ProxyFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ProxyErrorCode::StartFailed => "START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ProxyFailed => "PROXY_FAILED",
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
        }
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
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
