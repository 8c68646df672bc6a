// Session store
// Single writer for session state; every mutation is persisted

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::storage::{MemoryStorage, SessionStorage};
use super::types::{Identity, Session, TokenData};
use crate::error::ApiError;

/// Shared session state, injected into every component that needs it
pub struct SessionStore {
    state: RwLock<Session>,
    storage: Arc<dyn SessionStorage>,
}

impl SessionStore {
    /// Restore the last persisted session from `storage`
    ///
    /// Never fails: unreadable or inconsistent data yields the empty session.
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        let session = match storage.load() {
            Ok(Some(session)) if session.is_consistent() => {
                tracing::debug!(
                    authenticated = session.is_authenticated,
                    "Restored persisted session"
                );
                session
            }
            Ok(Some(_)) => {
                tracing::warn!("Persisted session is incomplete, starting signed out");
                Session::empty()
            }
            Ok(None) => Session::empty(),
            Err(e) => {
                tracing::warn!("Failed to load persisted session, starting signed out: {:#}", e);
                Session::empty()
            }
        };

        Self {
            state: RwLock::new(session),
            storage,
        }
    }

    /// Store backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Snapshot of the current session
    pub fn get(&self) -> Session {
        self.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().refresh_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_authenticated
    }

    /// Install a new token pair
    ///
    /// Identity fields absent from `identity` keep their previous values and a
    /// missing `refresh_token` keeps the current one. If the result would not hold
    /// both tokens and an identity the session is cleared instead.
    pub fn set_authenticated(
        &self,
        identity: Option<Identity>,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        self.install(true, None, identity, access_token, refresh_token, expires_at)
    }

    /// Start a fresh session from a login exchange; nothing from the previous one carries over
    pub fn begin(&self, tokens: &TokenData) -> Result<(), ApiError> {
        self.install(
            false,
            None,
            tokens.identity.clone(),
            tokens.access_token.clone(),
            tokens.refresh_token.clone(),
            tokens.expires_at,
        )
    }

    /// Install the result of a refresh exchange started with `refresh_token_used`
    ///
    /// Refused when the session no longer holds that refresh token, i.e. it was
    /// cleared or replaced while the exchange was running.
    pub fn apply_refreshed(
        &self,
        refresh_token_used: &str,
        tokens: &TokenData,
    ) -> Result<(), ApiError> {
        self.install(
            true,
            Some(refresh_token_used),
            tokens.identity.clone(),
            tokens.access_token.clone(),
            tokens.refresh_token.clone(),
            tokens.expires_at,
        )
    }

    fn install(
        &self,
        carry_over: bool,
        expected_refresh_token: Option<&str>,
        identity: Option<Identity>,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        let mut state = self.write();

        if let Some(expected) = expected_refresh_token {
            if state.refresh_token.as_deref() != Some(expected) {
                tracing::info!("Session changed during refresh, discarding renewed tokens");
                return Err(ApiError::Unauthorized(
                    "Session ended while it was being renewed".to_string(),
                ));
            }
        }

        let previous = if carry_over {
            state.clone()
        } else {
            Session::empty()
        };
        let known = previous.identity.unwrap_or_default();
        let merged = match identity {
            Some(newer) => known.merged_with(&newer),
            None => known,
        };

        let next = Session {
            identity: (!merged.is_empty()).then_some(merged),
            access_token: Some(access_token),
            refresh_token: refresh_token.or(previous.refresh_token),
            is_authenticated: true,
            expires_at,
            last_error: None,
        };

        if !next.has_complete_credentials() {
            let message = "Incomplete credentials received, please sign in again".to_string();
            tracing::warn!(
                has_refresh_token = next.refresh_token.is_some(),
                has_identity = next.identity.is_some(),
                "Refusing partially authenticated session"
            );
            *state = Session {
                last_error: Some(message.clone()),
                ..Session::empty()
            };
            self.persist(&state);
            return Err(ApiError::Unauthorized(message));
        }

        *state = next;
        self.persist(&state);
        Ok(())
    }

    /// Reset to the empty session
    pub fn clear(&self) {
        let mut state = self.write();
        self.reset(&mut state);
    }

    /// Reset to the empty session if it still holds `access_token`
    ///
    /// Returns whether the session was cleared. A session already cleared or
    /// rotated since `access_token` was read is left alone.
    pub fn clear_if_current(&self, access_token: Option<&str>) -> bool {
        let mut state = self.write();
        if state.access_token.as_deref() != access_token {
            return false;
        }
        self.reset(&mut state);
        true
    }

    fn reset(&self, state: &mut Session) {
        *state = Session::empty();
        if let Err(e) = self.storage.clear() {
            tracing::warn!("Failed to clear persisted session: {:#}", e);
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let mut state = self.write();
        state.last_error = Some(message.into());
    }

    pub fn clear_error(&self) {
        let mut state = self.write();
        state.last_error = None;
    }

    /// Whether the access token is due to expire within `threshold`
    ///
    /// For warning the user only. Sessions without expiry information report `false`.
    pub fn expires_within(&self, threshold: Duration) -> bool {
        match self.read().expires_at {
            Some(exp) => Utc::now()
                .checked_add_signed(threshold)
                .map_or(true, |limit| exp <= limit),
            None => false,
        }
    }

    fn persist(&self, session: &Session) {
        if let Err(e) = self.storage.save(session) {
            tracing::warn!("Failed to persist session: {:#}", e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
