// Non-verifying bearer token decoding
//
// Claims decoded here feed expiry warnings and identity display only.
// Whether a token is valid is decided by the backend accepting or rejecting it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::Identity;

/// Why a token could not be decoded
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),

    #[error("segment {0} is empty")]
    EmptySegment(usize),

    #[error("payload is not valid base64url: {0}")]
    Encoding(String),

    #[error("payload is not a JSON object: {0}")]
    Payload(String),
}

/// Claims extracted from a token body
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub subject: Option<String>,
    pub expires_at: Option<i64>,
    pub issued_at: Option<i64>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub raw: Map<String, Value>,
}

impl Claims {
    /// Expiry as a timestamp
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    }

    /// Issued-at as a timestamp
    pub fn issued_at_utc(&self) -> Option<DateTime<Utc>> {
        self.issued_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    }

    /// True if `exp` is at or before `now`; tokens without `exp` never expire here
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_utc().is_some_and(|exp| exp <= now)
    }

    /// Identity fields carried by the token
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.subject.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Decode a compact `header.payload.signature` token without verifying it
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(DecodeError::SegmentCount(0));
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::SegmentCount(segments.len()));
    }
    // Unsecured tokens carry an empty signature
    if let Some(index) = segments[..2].iter().position(|s| s.is_empty()) {
        return Err(DecodeError::EmptySegment(index));
    }

    // Some issuers pad their segments
    let body = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| DecodeError::Encoding(e.to_string()))?;

    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::Payload(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(DecodeError::Payload("body is not an object".to_string()));
    };

    Ok(Claims {
        subject: first_string(&map, &["sub", "userId", "user_id", "id"]),
        expires_at: first_seconds(&map, &["exp"]),
        issued_at: first_seconds(&map, &["iat"]),
        email: first_string(&map, &["email", "upn"]),
        display_name: first_string(&map, &["name", "displayName", "preferred_username"]),
        avatar_url: first_string(&map, &["picture", "avatarUrl", "avatar"]),
        raw: map,
    })
}

/// First present key rendered as a string; numeric ids are accepted
fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_seconds(map: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| {
        let value = map.get(*key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    })
}
