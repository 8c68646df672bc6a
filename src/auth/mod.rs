// Authentication module
// Session state, token decoding, refresh and teardown

pub mod claims;
mod refresh;
mod storage;
mod store;
mod teardown;
mod types;

pub use refresh::{exchange, token_data_from_payload, RefreshCoordinator, RefreshError};
pub use storage::{open_session_storage, MemoryStorage, SessionStorage, SqliteStorage};
pub use store::SessionStore;
pub use teardown::{LogNavigator, LogoutOutcome, Navigator, SessionTeardown, TeardownReason};
pub use types::{Identity, LoginRequest, LogoutRequest, Session, TokenData, TokenPayload};
