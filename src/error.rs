//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request path has no app slug after the proxy base
    MalformedPath,
    /// Slug does not name a configured route
    UnknownApp,
    /// Request path is outside the proxy base
    NotProxied,
    /// Timed out waiting for backend response headers
    RequestTimeout,
    /// Failed to connect to or talk to the backend
    ConnectionFailed,
    /// Client connection cannot be taken over for a WebSocket tunnel
    WebsocketUnsupported,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MalformedPath => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ProxyErrorCode::NotProxied => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::WebsocketUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MalformedPath => "MALFORMED_PATH",
            ProxyErrorCode::UnknownApp => "UNKNOWN_APP",
            ProxyErrorCode::NotProxied => "NOT_PROXIED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::WebsocketUnsupported => "WEBSOCKET_UNSUPPORTED",
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
pub fn json_error_response<E>(code: ProxyErrorCode, message: impl Into<String>) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
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

/// Errors raised while turning an app descriptor into a route
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("app '{name}': invalid URL '{url}': {source}")]
    InvalidUrl {
        name: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("app '{name}': unsupported URL scheme '{scheme}'")]
    UnsupportedScheme { name: String, scheme: String },

    #[error("app '{name}': URL '{url}' has no host")]
    MissingHost { name: String, url: String },

    #[error("app '{name}': URL '{url}' points back into the proxy")]
    ProxyLoop { name: String, url: String },

    #[error("app '{name}': name does not produce a usable slug")]
    EmptySlug { name: String },

    #[error("app '{name}': invalid header '{header}'")]
    InvalidHeader { name: String, header: String },

    #[error("app '{name}': TLS setup failed: {source}")]
    Tls {
        name: String,
        #[source]
        source: rustls::Error,
    },
}

/// Errors from sending a request to a backend
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response headers within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

/// Errors from the raw WebSocket handshake framing
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend closed the connection before responding")]
    UnexpectedEof,

    #[error("response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("malformed status line: {0}")]
    BadStatusLine(String),

    #[error("malformed header line: {0}")]
    BadHeader(String),

    #[error("malformed chunked body")]
    BadChunk,
}
