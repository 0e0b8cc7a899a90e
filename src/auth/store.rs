// Durable credential storage in a local SQLite key/value table

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::types::{CredentialPair, Session};

const KEY_SESSION: &str = "fieldbook:session:current-user";
const KEY_ACCESS_TOKEN: &str = "fieldbook:session:access-token";
const KEY_REFRESH_TOKEN: &str = "fieldbook:session:refresh-token";

/// Whatever survived the last process
#[derive(Debug, Default, Clone)]
pub struct PersistedState {
    pub session: Option<Session>,
    pub credentials: Option<CredentialPair>,
}

/// Credential store backed by the `auth_kv` table
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Non-durable store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement cannot leave SQLite half-written; keep going
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the persisted session and credential pair.
    ///
    /// A half-present pair or an unreadable session is treated as corrupt:
    /// everything is cleared and an empty state is returned.
    pub fn load(&self) -> Result<PersistedState> {
        let conn = self.conn();
        let session_json = get(&conn, KEY_SESSION)?;
        let access_token = get(&conn, KEY_ACCESS_TOKEN)?;
        let refresh_token = get(&conn, KEY_REFRESH_TOKEN)?;

        let session = match session_json {
            Some(json) => match serde_json::from_str::<Session>(&json) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!("Persisted session is unreadable, clearing store: {}", e);
                    clear_all(&conn)?;
                    return Ok(PersistedState::default());
                }
            },
            None => None,
        };

        let credentials = match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Some(CredentialPair {
                access_token,
                refresh_token,
            }),
            (None, None) => None,
            _ => {
                tracing::warn!("Persisted credential pair is incomplete, clearing store");
                clear_all(&conn)?;
                return Ok(PersistedState::default());
            }
        };

        Ok(PersistedState {
            session,
            credentials,
        })
    }

    /// Persist a freshly established session together with its credentials
    pub fn save_login(&self, session: &Session, credentials: &CredentialPair) -> Result<()> {
        let session_json = serde_json::to_string(session).context("Failed to serialize session")?;

        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        put(&tx, KEY_SESSION, &session_json)?;
        put(&tx, KEY_ACCESS_TOKEN, &credentials.access_token)?;
        put(&tx, KEY_REFRESH_TOKEN, &credentials.refresh_token)?;
        tx.commit().context("Failed to commit login credentials")?;
        Ok(())
    }

    /// Replace the access token (and optionally rotate the refresh token)
    pub fn save_refreshed(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        put(&tx, KEY_ACCESS_TOKEN, access_token)?;
        if let Some(refresh_token) = refresh_token {
            put(&tx, KEY_REFRESH_TOKEN, refresh_token)?;
        }
        tx.commit().context("Failed to commit refreshed token")?;
        Ok(())
    }

    /// Current access token, if any
    pub fn access_token(&self) -> Result<Option<String>> {
        get(&self.conn(), KEY_ACCESS_TOKEN)
    }

    /// Current refresh token, if any
    pub fn refresh_token(&self) -> Result<Option<String>> {
        get(&self.conn(), KEY_REFRESH_TOKEN)
    }

    /// Remove the session and both tokens
    pub fn clear(&self) -> Result<()> {
        clear_all(&self.conn())
    }

    /// True when nothing is persisted
    pub fn is_empty(&self) -> Result<bool> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM auth_kv WHERE key IN (?1, ?2, ?3)",
                params![KEY_SESSION, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN],
                |row| row.get(0),
            )
            .context("Failed to count persisted entries")?;
        Ok(count == 0)
    }
}

fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
        row.get(0)
    })
    .optional()
    .with_context(|| format!("Failed to read {} from store", key))
}

fn put(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .with_context(|| format!("Failed to write {} to store", key))?;
    Ok(())
}

fn clear_all(conn: &Connection) -> Result<()> {
    conn.execute(
        "DELETE FROM auth_kv WHERE key IN (?1, ?2, ?3)",
        params![KEY_SESSION, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN],
    )
    .context("Failed to clear persisted credentials")?;
    Ok(())
}
