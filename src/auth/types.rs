// Session and token types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identity of the signed-in account
///
/// Every field is optional so that partial updates (a refresh response that
/// only carries an id, for example) can be merged over what is already known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(
        default,
        alias = "userId",
        alias = "user_id",
        alias = "sub",
        deserialize_with = "string_or_number"
    )]
    pub id: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default, alias = "display_name", alias = "name", alias = "fullName")]
    pub display_name: Option<String>,

    #[serde(default, alias = "avatar_url", alias = "avatar", alias = "picture")]
    pub avatar_url: Option<String>,
}

impl Identity {
    /// True when no field carries a value
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.email.is_none()
            && self.display_name.is_none()
            && self.avatar_url.is_none()
    }

    /// Overlay `newer` on top of `self`, keeping fields `newer` does not set
    pub fn merged_with(&self, newer: &Identity) -> Identity {
        Identity {
            id: newer.id.clone().or_else(|| self.id.clone()),
            email: newer.email.clone().or_else(|| self.email.clone()),
            display_name: newer
                .display_name
                .clone()
                .or_else(|| self.display_name.clone()),
            avatar_url: newer.avatar_url.clone().or_else(|| self.avatar_url.clone()),
        }
    }
}

/// Client-held session state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub identity: Option<Identity>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub is_authenticated: bool,

    /// Bookkeeping only; never consulted for authorization
    pub expires_at: Option<DateTime<Utc>>,

    /// Last authentication-related failure
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl Session {
    /// The empty, unauthenticated session
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the authenticated flag agrees with the credentials held
    pub fn is_consistent(&self) -> bool {
        !self.is_authenticated || self.has_complete_credentials()
    }

    /// Both tokens and a non-empty identity are present
    pub fn has_complete_credentials(&self) -> bool {
        self.access_token.is_some()
            && self.refresh_token.is_some()
            && self.identity.as_ref().is_some_and(|i| !i.is_empty())
    }

    /// A refresh exchange is only attempted with a refresh token and a known identity
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.identity.as_ref().is_some_and(|i| !i.is_empty())
    }
}

/// Token data produced by a login or refresh exchange
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub identity: Option<Identity>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Logout request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest<'a> {
    pub refresh_token: Option<&'a str>,
}

/// Token payload shared by the login and refresh endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    #[serde(alias = "access_token", alias = "token")]
    pub access_token: String,

    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,

    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<i64>,

    #[serde(default, alias = "identity", alias = "profile")]
    pub user: Option<Identity>,
}

impl TokenPayload {
    /// Parse a token payload, either bare or wrapped in the `{ data: ... }` envelope
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        match value.get("data") {
            Some(data) if data.is_object() => serde_json::from_value(data.clone()),
            _ => serde_json::from_value(value),
        }
    }
}

/// Accept ids that the backend sends as numbers
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
