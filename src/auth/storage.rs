// Durable session storage

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::types::{Identity, Session};

const KEY_ACCESS_TOKEN: &str = "session:access_token";
const KEY_REFRESH_TOKEN: &str = "session:refresh_token";
const KEY_IS_AUTHENTICATED: &str = "session:is_authenticated";
const KEY_IDENTITY: &str = "session:identity";
const KEY_EXPIRES_AT: &str = "session:expires_at";

/// Backing store for the session, read once at startup and written on every mutation
pub trait SessionStorage: Send + Sync {
    /// Load the persisted session, `None` if nothing was ever written
    fn load(&self) -> Result<Option<Session>>;

    /// Persist the session, replacing what was stored
    fn save(&self, session: &Session) -> Result<()>;

    /// Remove every persisted key
    fn clear(&self) -> Result<()>;
}

/// SQLite-backed storage using a namespaced key/value table
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// Open the database at `path`, moving an unreadable file aside and starting over
    ///
    /// The unreadable file is kept next to the original with a `.corrupt` suffix.
    pub fn open_or_reset(path: &Path) -> Result<Self> {
        match Self::open(path) {
            Ok(storage) => Ok(storage),
            Err(e) if path.exists() => {
                let aside = corrupt_path(path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    "Session database is unreadable, starting over: {:#}",
                    e
                );
                std::fs::rename(path, &aside).with_context(|| {
                    format!("Failed to move unreadable session database: {}", path.display())
                })?;
                Self::open(path)
            }
            Err(e) => Err(e),
        }
    }

    /// In-memory database, mostly useful for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create session_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT key, value FROM session_kv WHERE key LIKE 'session:%'")
            .context("Failed to prepare session query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query session keys")?;

        let mut values = HashMap::new();
        for row in rows {
            let (key, value) = row.context("Failed to read session row")?;
            values.insert(key, value);
        }
        Ok(values)
    }

    /// Write raw values, bypassing serialization (used to simulate corruption in tests)
    #[cfg(test)]
    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO session_kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

impl SessionStorage for SqliteStorage {
    fn load(&self) -> Result<Option<Session>> {
        let mut values = self.read_all()?;
        if values.is_empty() {
            return Ok(None);
        }

        let identity = values
            .remove(KEY_IDENTITY)
            .map(|json| serde_json::from_str::<Identity>(&json))
            .transpose()
            .context("Failed to parse persisted identity")?;

        let expires_at = values
            .remove(KEY_EXPIRES_AT)
            .map(|s| parse_datetime(&s))
            .transpose()?;

        let is_authenticated = match values.remove(KEY_IS_AUTHENTICATED).as_deref() {
            Some("true") => true,
            Some("false") | None => false,
            Some(other) => anyhow::bail!("Invalid persisted authentication flag: {}", other),
        };

        Ok(Some(Session {
            identity,
            access_token: values.remove(KEY_ACCESS_TOKEN),
            refresh_token: values.remove(KEY_REFRESH_TOKEN),
            is_authenticated,
            expires_at,
            last_error: None,
        }))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let identity = session
            .identity
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize identity")?;

        let entries: [(&str, Option<String>); 5] = [
            (KEY_ACCESS_TOKEN, session.access_token.clone()),
            (KEY_REFRESH_TOKEN, session.refresh_token.clone()),
            (
                KEY_IS_AUTHENTICATED,
                Some(session.is_authenticated.to_string()),
            ),
            (KEY_IDENTITY, identity),
            (KEY_EXPIRES_AT, session.expires_at.map(|t| t.to_rfc3339())),
        ];

        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("Failed to begin session transaction")?;
        tx.execute("DELETE FROM session_kv WHERE key LIKE 'session:%'", [])?;
        for (key, value) in entries {
            if let Some(value) = value {
                tx.execute(
                    "INSERT INTO session_kv (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
            }
        }
        tx.commit().context("Failed to commit session transaction")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM session_kv WHERE key LIKE 'session:%'", [])
            .context("Failed to clear session keys")?;
        Ok(())
    }
}

/// Process-local storage; nothing survives a restart
#[derive(Default)]
pub struct MemoryStorage {
    session: Mutex<Option<Session>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded storage, as if a previous run had persisted `session`
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, session: &Session) -> Result<()> {
        let mut persisted = session.clone();
        persisted.last_error = None;
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(persisted);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// Durable storage at `path`, or process memory when the database cannot be used at all
///
/// Never fails: a lost or corrupt session file means starting signed out.
pub fn open_session_storage(path: &Path) -> Arc<dyn SessionStorage> {
    match SqliteStorage::open_or_reset(path) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                "Session database unavailable, the session will not survive a restart: {:#}",
                e
            );
            Arc::new(MemoryStorage::new())
        }
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Parse datetime from RFC 3339, accepting a bare `Z` suffix
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let normalized = if s.ends_with('Z') {
        s.replace('Z', "+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            identity: Some(Identity {
                id: Some("u1".to_string()),
                email: Some("u1@example.com".to_string()),
                display_name: None,
                avatar_url: None,
            }),
            access_token: Some("access".to_string()),
            refresh_token: Some("refresh".to_string()),
            is_authenticated: true,
            expires_at: parse_datetime("2030-01-12T10:30:00Z").ok(),
            last_error: Some("not persisted".to_string()),
        }
    }

    #[test]
    fn test_parse_datetime() {
        let dt = parse_datetime("2025-01-12T10:30:00Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-12T10:30:00+00:00");

        let dt = parse_datetime("2025-01-12T10:30:00+00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-12T10:30:00+00:00");

        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn test_sqlite_save_and_load() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.load().unwrap().is_none());

        storage.save(&sample_session()).unwrap();
        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("access"));
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
        assert!(loaded.is_authenticated);
        assert_eq!(
            loaded.identity.unwrap().email.as_deref(),
            Some("u1@example.com")
        );
        assert!(loaded.expires_at.is_some());
        assert!(loaded.last_error.is_none());
    }

    #[test]
    fn test_sqlite_save_drops_absent_keys() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save(&sample_session()).unwrap();
        storage.save(&Session::empty()).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert!(loaded.access_token.is_none());
        assert!(loaded.identity.is_none());
        assert!(!loaded.is_authenticated);
    }

    #[test]
    fn test_sqlite_clear() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save(&sample_session()).unwrap();
        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_sqlite_corrupt_identity_is_an_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save(&sample_session()).unwrap();
        storage.put_raw(KEY_IDENTITY, "{not json").unwrap();
        assert!(storage.load().is_err());

        storage.put_raw(KEY_IDENTITY, "{}").unwrap();
        storage.put_raw(KEY_IS_AUTHENTICATED, "maybe").unwrap();
        assert!(storage.load().is_err());
    }

    #[test]
    fn test_sqlite_file_survives_reopen() {
        let path = temp_db_path();
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save(&sample_session()).unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
        let _ = std::fs::remove_file(&path);
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("session-{}.sqlite3", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_garbage_file_is_moved_aside() {
        let path = temp_db_path();
        std::fs::write(&path, b"this is not a sqlite database, not even close").unwrap();
        assert!(SqliteStorage::open(&path).is_err());

        let storage = SqliteStorage::open_or_reset(&path).unwrap();
        assert!(storage.load().unwrap().is_none());
        storage.save(&sample_session()).unwrap();
        assert!(storage.load().unwrap().is_some());

        let aside = corrupt_path(&path);
        assert_eq!(
            std::fs::read(&aside).unwrap(),
            b"this is not a sqlite database, not even close"
        );
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&aside);
    }

    #[test]
    fn test_unusable_location_falls_back_to_memory() {
        // A regular file where the parent directory should be
        let blocker = temp_db_path();
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("session.sqlite3");

        let storage = open_session_storage(&path);
        assert!(storage.load().unwrap().is_none());
        storage.save(&sample_session()).unwrap();
        assert!(storage.load().unwrap().is_some());
        let _ = std::fs::remove_file(&blocker);
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert!(storage.load().unwrap().is_none());
        storage.save(&sample_session()).unwrap();
        let loaded = storage.load().unwrap().unwrap();
        assert!(loaded.last_error.is_none());
        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_none());
    }
}
