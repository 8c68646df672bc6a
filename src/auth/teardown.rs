// Session teardown
// Clears local state and sends the user back to the sign-in entry point

use std::sync::Arc;

use super::store::SessionStore;

/// Receives the redirect to the unauthenticated entry point
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self, message: &str);
}

/// Navigator that only logs the redirect
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect_to_login(&self, message: &str) {
        tracing::info!(notice = %message, "Redirecting to sign-in");
    }
}

/// How the backend answered the logout call
///
/// Every outcome ends with the local session cleared; only the message differs.
#[derive(Debug, Clone, PartialEq)]
pub enum LogoutOutcome {
    /// 2xx
    Completed,
    /// 401, or there was no token to revoke
    AlreadyLoggedOut,
    /// 5xx, another rejection, or the backend was unreachable
    Degraded { status: Option<u16> },
}

impl LogoutOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => LogoutOutcome::Completed,
            401 => LogoutOutcome::AlreadyLoggedOut,
            other => LogoutOutcome::Degraded {
                status: Some(other),
            },
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            LogoutOutcome::Completed => "You have been signed out.",
            LogoutOutcome::AlreadyLoggedOut => "Your session had already ended. You are signed out.",
            LogoutOutcome::Degraded { .. } => {
                "You have been signed out on this device, but the server could not confirm it."
            }
        }
    }
}

/// Why the session is being torn down
#[derive(Debug, Clone, PartialEq)]
pub enum TeardownReason {
    Logout(LogoutOutcome),
    /// A protected call was rejected and could not be recovered
    SessionExpired,
    /// The refresh exchange failed
    RefreshFailed,
}

impl TeardownReason {
    pub fn message(&self) -> &'static str {
        match self {
            TeardownReason::Logout(outcome) => outcome.message(),
            TeardownReason::SessionExpired => "Your session has expired. Please sign in again.",
            TeardownReason::RefreshFailed => {
                "Your session could not be renewed. Please sign in again."
            }
        }
    }
}

pub struct SessionTeardown {
    store: Arc<SessionStore>,
    navigator: Arc<dyn Navigator>,
}

impl SessionTeardown {
    pub fn new(store: Arc<SessionStore>, navigator: Arc<dyn Navigator>) -> Self {
        Self { store, navigator }
    }

    /// Clear the session and redirect
    pub fn run(&self, reason: &TeardownReason) {
        tracing::info!(reason = ?reason, "Tearing down session");

        self.store.clear();
        self.notify(reason);
    }

    /// Tear down the session a call was made under
    ///
    /// Does nothing when the session no longer holds `access_token`: it has
    /// already been torn down, signed out or renewed, so the user is not
    /// redirected a second time. Returns whether the teardown ran.
    pub fn run_if_current(&self, reason: &TeardownReason, access_token: Option<&str>) -> bool {
        if !self.store.clear_if_current(access_token) {
            tracing::debug!(reason = ?reason, "Session already ended, skipping teardown");
            return false;
        }

        tracing::info!(reason = ?reason, "Tearing down session");
        self.notify(reason);
        true
    }

    fn notify(&self, reason: &TeardownReason) {
        if !matches!(reason, TeardownReason::Logout(_)) {
            self.store.set_error(reason.message());
        }
        self.navigator.redirect_to_login(reason.message());
    }
}
