//! SQLite storage for sessions and their persistent state scopes.
//!
//! `session:` keys are stored per session, `user:` keys per user so every
//! conversation of that user sees them. `temp:` keys never reach this module.

use crate::state::{Scope, ScopeEntries};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A session as stored: its serialized body plus its `session:` entries.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: Uuid,
    pub user_id: String,
    pub session_json: String,
    pub state: ScopeEntries,
}

#[derive(Debug, Default)]
pub struct StoredData {
    pub sessions: Vec<SessionRow>,
    pub users: HashMap<String, ScopeEntries>,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let store = Self { path };
        store.run(ensure_schema).await?;
        tracing::info!(path = %store.path.display(), "session store ready");
        Ok(store)
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn load(&self) -> Result<StoredData> {
        self.run(|conn| {
            let mut data = StoredData::default();
            let mut stmt = conn.prepare(
                "SELECT owner_kind, owner_id, key, value_json FROM toolgate_state",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut session_state: HashMap<String, ScopeEntries> = HashMap::new();
            for row in rows {
                let (kind, owner, key, value_json) = row?;
                let value: serde_json::Value = serde_json::from_str(&value_json)?;
                let target = match kind.as_str() {
                    "session" => session_state.entry(owner).or_default(),
                    "user" => data.users.entry(owner).or_default(),
                    other => {
                        return Err(StoreError::Corrupt(format!("unknown owner kind {other:?}")));
                    }
                };
                target.insert(key, value);
            }
            drop(stmt);

            let mut stmt =
                conn.prepare("SELECT id, user_id, session_json FROM toolgate_sessions")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (id, user_id, session_json) = row?;
                let parsed = Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Corrupt(format!("session id {id:?}: {e}")))?;
                data.sessions.push(SessionRow {
                    id: parsed,
                    user_id,
                    state: session_state.remove(&id).unwrap_or_default(),
                    session_json,
                });
            }
            Ok(data)
        })
        .await
    }

    /// Replace the stored copy of one session and its user's shared entries.
    pub async fn save(&self, row: SessionRow, user_state: ScopeEntries) -> Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
INSERT INTO toolgate_sessions (id, user_id, session_json, updated_at)
VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
ON CONFLICT(id) DO UPDATE
SET session_json = excluded.session_json,
    updated_at = CURRENT_TIMESTAMP
"#,
                params![row.id.to_string(), row.user_id, row.session_json],
            )?;
            replace_entries(&tx, Scope::Session, &row.id.to_string(), &row.state)?;
            replace_entries(&tx, Scope::User, &row.user_id, &user_state)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        self.run(move |conn| {
            let id = id.to_string();
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM toolgate_sessions WHERE id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM toolgate_state WHERE owner_kind = 'session' AND owner_id = ?1",
                params![id],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    /// Cheap liveness probe used by `doctor`.
    pub async fn session_count(&self) -> Result<i64> {
        self.run(|conn| {
            let count: Option<i64> = conn
                .query_row("SELECT COUNT(*) FROM toolgate_sessions", [], |row| row.get(0))
                .optional()?;
            Ok(count.unwrap_or(0))
        })
        .await
    }
}

fn ensure_schema(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS toolgate_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    session_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS toolgate_state (
    owner_kind TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (owner_kind, owner_id, key)
);
"#,
    )?;
    Ok(())
}

fn replace_entries(
    tx: &rusqlite::Transaction<'_>,
    scope: Scope,
    owner_id: &str,
    entries: &ScopeEntries,
) -> Result<()> {
    let kind = match scope {
        Scope::Session => "session",
        Scope::User => "user",
        Scope::Temp => return Ok(()),
    };
    tx.execute(
        "DELETE FROM toolgate_state WHERE owner_kind = ?1 AND owner_id = ?2",
        params![kind, owner_id],
    )?;
    let mut stmt = tx.prepare(
        "INSERT INTO toolgate_state (owner_kind, owner_id, key, value_json) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (key, value) in entries {
        stmt.execute(params![kind, owner_id, key, serde_json::to_string(value)?])?;
    }
    Ok(())
}
