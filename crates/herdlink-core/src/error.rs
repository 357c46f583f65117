use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the gateway.
///
/// `Clone` so that a single shared in-flight future can hand the same
/// outcome to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Network unavailable: {0}")]
    Connectivity(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Credential expired")]
    CredentialExpired,

    #[error("Anti-forgery token rejected")]
    AntiForgery,

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Body fragments that mark a 401 as an expired credential.
const EXPIRY_MARKERS: &[&str] = &["expired", "token_expired", "jwt expired"];

/// Body fragments that mark a 401 as an anti-forgery mismatch.
const CSRF_MARKERS: &[&str] = &["csrf", "xsrf", "anti-forgery"];

impl GatewayError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
            None => body.to_string(),
            Some((cut, _)) => format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            ),
        }
    }

    /// Pull the human-readable message out of an error body.
    ///
    /// Servers disagree on where they put it, so look at the usual
    /// fields before falling back to the raw (truncated) text.
    pub fn server_message(body: &str) -> String {
        if let Ok(json) = serde_json::from_str::<Value>(body) {
            for field in ["message", "error", "detail", "msg"] {
                match json.get(field) {
                    Some(Value::String(s)) if !s.is_empty() => return Self::truncate_body(s),
                    Some(Value::Object(inner)) => {
                        if let Some(Value::String(s)) = inner.get("message") {
                            return Self::truncate_body(s);
                        }
                    }
                    _ => {}
                }
            }
        }
        Self::truncate_body(body)
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::server_message(body);
        match status {
            401 => Self::classify_unauthorized(body, message),
            403 => GatewayError::AccessDenied(message),
            404 => GatewayError::NotFound(message),
            429 => GatewayError::RateLimited,
            500..=599 => GatewayError::Server { status, message },
            _ => GatewayError::Rejected { status, message },
        }
    }

    fn classify_unauthorized(body: &str, message: String) -> Self {
        let lower = body.to_lowercase();
        if CSRF_MARKERS.iter().any(|m| lower.contains(m)) {
            GatewayError::AntiForgery
        } else if EXPIRY_MARKERS.iter().any(|m| lower.contains(m)) {
            GatewayError::CredentialExpired
        } else {
            GatewayError::Authentication(message)
        }
    }

    /// True for failures that mean the server was never reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GatewayError::Connectivity(_) | GatewayError::Timeout(_))
    }

    /// True for any of the 401 classifications.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            GatewayError::CredentialExpired
                | GatewayError::AntiForgery
                | GatewayError::Authentication(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::CredentialExpired
            | GatewayError::AntiForgery
            | GatewayError::Authentication(_) => Some(401),
            GatewayError::AccessDenied(_) => Some(403),
            GatewayError::NotFound(_) => Some(404),
            GatewayError::RateLimited => Some(429),
            GatewayError::Rejected { status, .. } | GatewayError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidResponse(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_request() {
            GatewayError::Connectivity(err.to_string())
        } else if err.is_decode() || err.is_body() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Connectivity(err.to_string())
        }
    }
}
