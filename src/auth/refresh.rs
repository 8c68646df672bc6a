// Token refresh logic

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::claims;
use super::store::SessionStore;
use super::types::{Identity, TokenData, TokenPayload};
use crate::error::extract_message;

/// Failure of the refresh exchange
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct RefreshError {
    /// Status returned by the refresh endpoint, `None` for transport or local failures
    pub status: Option<u16>,
    pub message: String,
}

impl RefreshError {
    fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenData, RefreshError>>>;

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

/// Runs refresh exchanges, at most one at a time
///
/// Callers that ask for a refresh while one is already running wait on the same
/// exchange and observe its result.
pub struct RefreshCoordinator {
    client: Client,
    refresh_url: Url,
    store: Arc<SessionStore>,
    inflight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(client: Client, refresh_url: Url, store: Arc<SessionStore>) -> Self {
        Self {
            client,
            refresh_url,
            store,
            inflight: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Exchange the current refresh token for a new pair and install it in the store
    pub async fn refresh(&self) -> Result<TokenData, RefreshError> {
        let (id, future) = {
            let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(inflight) => {
                    tracing::debug!(refresh_id = inflight.id, "Joining in-flight token refresh");
                    (inflight.id, inflight.future.clone())
                }
                None => {
                    let refresh_token = self
                        .store
                        .refresh_token()
                        .ok_or_else(|| RefreshError::new(None, "No refresh token available"))?;

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = exchange_and_store(
                        self.client.clone(),
                        self.refresh_url.clone(),
                        self.store.clone(),
                        refresh_token,
                    )
                    .boxed()
                    .shared();

                    *slot = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|inflight| inflight.id == id) {
            *slot = None;
        }

        result
    }
}

async fn exchange_and_store(
    client: Client,
    url: Url,
    store: Arc<SessionStore>,
    refresh_token: String,
) -> Result<TokenData, RefreshError> {
    let tokens = exchange(&client, &url, &refresh_token).await?;
    store
        .apply_refreshed(&refresh_token, &tokens)
        .map_err(|e| RefreshError::new(None, e.user_message()))?;
    Ok(tokens)
}

/// Call the refresh endpoint with the refresh token as bearer credential
pub async fn exchange(
    client: &Client,
    url: &Url,
    refresh_token: &str,
) -> Result<TokenData, RefreshError> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(url.clone())
        .bearer_auth(refresh_token)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Refresh request failed to send");
            RefreshError::new(None, format!("Refresh request failed: {}", e))
        })?;

    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(status = status.as_u16(), error = %e, "Failed to read refresh response body");
            Default::default()
        }
    };

    if !status.is_success() {
        let message = extract_message(&body)
            .unwrap_or_else(|| format!("Refresh rejected with status {}", status.as_u16()));
        tracing::warn!(status = status.as_u16(), message = %message, "Token refresh rejected");
        return Err(RefreshError::new(Some(status.as_u16()), message));
    }

    let payload = TokenPayload::from_slice(&body).map_err(|e| {
        RefreshError::new(
            Some(status.as_u16()),
            format!("Failed to parse refresh response: {}", e),
        )
    })?;

    let tokens = token_data_from_payload(payload, None)
        .map_err(|message| RefreshError::new(Some(status.as_u16()), message))?;

    tracing::info!(
        expires_at = ?tokens.expires_at.map(|t| t.to_rfc3339()),
        rotated_refresh_token = tokens.refresh_token.is_some(),
        "Access token refreshed"
    );

    Ok(tokens)
}

/// Turn a login/refresh payload into token data
///
/// Identity comes from the payload's user object, then the token's own claims,
/// then `fallback`. Expiry comes from `expiresIn` (less a 60 second buffer) or the
/// token's `exp` claim.
pub fn token_data_from_payload(
    payload: TokenPayload,
    fallback: Option<Identity>,
) -> Result<TokenData, String> {
    if payload.access_token.trim().is_empty() {
        return Err("Response does not contain an access token".to_string());
    }

    let claims = claims::decode(&payload.access_token).ok();

    // An expiry too far out to represent is treated as unknown
    let expires_at = match payload.expires_in {
        Some(secs) => Duration::try_seconds(secs.saturating_sub(60).max(0))
            .and_then(|ttl| Utc::now().checked_add_signed(ttl)),
        None => claims.as_ref().and_then(|c| c.expires_at_utc()),
    };

    let mut identity = fallback.unwrap_or_default();
    if let Some(claims) = &claims {
        identity = identity.merged_with(&claims.identity());
    }
    if let Some(user) = &payload.user {
        identity = identity.merged_with(user);
    }

    Ok(TokenData {
        access_token: payload.access_token,
        refresh_token: payload.refresh_token.filter(|t| !t.is_empty()),
        expires_at,
        identity: (!identity.is_empty()).then_some(identity),
    })
}
