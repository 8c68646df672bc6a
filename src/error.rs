// Error handling module
// Caller-facing error taxonomy and backend message extraction

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::auth::claims::DecodeError;

/// Errors surfaced by the session client
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request never reached the server, or no response arrived in time
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// 401 on a protected call that could not be recovered
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 403, e.g. account disabled or unverified
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 400 or 422, message passed through verbatim from the backend
    #[error("Validation error: {message}")]
    Validation { status: u16, message: String },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// The refresh exchange itself failed; the session has been torn down
    #[error("Session could not be renewed: {0}")]
    RefreshFailure(String),

    /// A token could not be parsed (converted from `DecodeError`); handled like `Unauthorized`
    #[error("Malformed token: {0}")]
    MalformedToken(#[from] DecodeError),

    /// Any other non-success status
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Map a failed response to its category, preferring the backend's own message
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let message = extract_message(body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });
        let code = status.as_u16();

        match code {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            400 | 422 => ApiError::Validation {
                status: code,
                message,
            },
            500..=599 => ApiError::ServerError {
                status: code,
                message,
            },
            _ => ApiError::Http {
                status: code,
                message,
            },
        }
    }

    /// Categorize a transport failure
    pub fn from_transport(e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ApiError::Network {
            kind,
            message: e.to_string(),
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized(_) => Some(401),
            ApiError::Forbidden(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::Validation { status, .. }
            | ApiError::ServerError { status, .. }
            | ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Stable category tag
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network { .. } => "network",
            ApiError::Unauthorized(_) | ApiError::MalformedToken(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation { .. } => "validation",
            ApiError::ServerError { .. } => "server_error",
            ApiError::RefreshFailure(_) => "refresh_failure",
            ApiError::Http { .. } => "http",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::RefreshFailure(m)
            | ApiError::Validation { message: m, .. }
            | ApiError::ServerError { message: m, .. }
            | ApiError::Http { message: m, .. } => m.clone(),
            ApiError::Network { kind: "timeout", .. } => "The request timed out".to_string(),
            ApiError::Network { .. } => "Unable to reach the server".to_string(),
            ApiError::MalformedToken(_) => "Your session is invalid, please sign in again".to_string(),
            ApiError::Internal(_) => "Something went wrong".to_string(),
        }
    }

    /// Whether this error means the caller no longer holds a usable session
    pub fn is_session_ending(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized(_) | ApiError::MalformedToken(_) | ApiError::RefreshFailure(_)
        )
    }
}

/// Pull a human-readable message out of an error body
///
/// Checks `customerMessage`, then `message`, then `error` (string or `{ message }`).
pub fn extract_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;

    let candidates = [
        value.get("customerMessage"),
        value.get("message"),
        value.get("error").filter(|v| v.is_string()),
        value.get("error").and_then(|e| e.get("message")),
    ];

    let found = candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string);
    found
}
