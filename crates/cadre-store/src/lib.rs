mod agents;
mod audit;
mod cards;
mod pending;
mod threads;
mod workspace;

pub use pending::SqlitePendingStore;
pub use threads::{ThreadMessageRecord, ThreadRecord};

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable store shared by every subsystem. One SQLite connection in WAL
/// mode behind an async mutex; statements are short and the busy timeout
/// covers writer contention.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Store {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id          TEXT PRIMARY KEY,
                title       TEXT NOT NULL DEFAULT '',
                cwd         TEXT NOT NULL DEFAULT '',
                model       TEXT,
                archived    INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS thread_messages (
                id          TEXT PRIMARY KEY,
                thread_id   TEXT NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_thread_messages_thread
                ON thread_messages(thread_id, created_at);

            CREATE TABLE IF NOT EXISTS bus_pending (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                seq         INTEGER NOT NULL,
                topic       TEXT NOT NULL,
                message     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bus_pending_seq ON bus_pending(seq);

            CREATE TABLE IF NOT EXISTS command_cards (
                key         TEXT PRIMARY KEY,
                title       TEXT NOT NULL DEFAULT '',
                template    TEXT NOT NULL,
                risk_level  TEXT NOT NULL DEFAULT 'normal',
                enabled     INTEGER NOT NULL DEFAULT 1,
                timeout_sec INTEGER
            );

            CREATE TABLE IF NOT EXISTS command_card_runs (
                id               TEXT PRIMARY KEY,
                card_key         TEXT NOT NULL,
                requested_by     TEXT NOT NULL DEFAULT '',
                params           TEXT NOT NULL DEFAULT '{}',
                rendered_command TEXT NOT NULL,
                risk_level       TEXT NOT NULL,
                status           TEXT NOT NULL,
                requires_review  INTEGER NOT NULL DEFAULT 0,
                output           TEXT NOT NULL DEFAULT '',
                exit_code        INTEGER,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                executed_at      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_card_runs_status
                ON command_card_runs(status, updated_at);

            CREATE TABLE IF NOT EXISTS workspace_runs (
                run_key        TEXT PRIMARY KEY,
                dag_key        TEXT NOT NULL DEFAULT '',
                source_root    TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                status         TEXT NOT NULL,
                metadata       TEXT NOT NULL DEFAULT '{}',
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workspace_files (
                run_key              TEXT NOT NULL,
                relative_path        TEXT NOT NULL,
                baseline_sha256      TEXT NOT NULL DEFAULT '',
                workspace_sha256     TEXT NOT NULL DEFAULT '',
                source_sha256_before TEXT NOT NULL DEFAULT '',
                source_sha256_after  TEXT NOT NULL DEFAULT '',
                state                TEXT NOT NULL,
                last_error           TEXT,
                PRIMARY KEY (run_key, relative_path)
            );

            CREATE TABLE IF NOT EXISTS agents (
                thread_id  TEXT PRIMARY KEY,
                port       INTEGER NOT NULL,
                pid        INTEGER NOT NULL,
                status     TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id         TEXT PRIMARY KEY,
                actor      TEXT NOT NULL DEFAULT '',
                action     TEXT NOT NULL,
                subject    TEXT NOT NULL,
                detail     TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject, created_at);
            "#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initializes_twice_without_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cadre.db");
        let first = Store::open(&path).await.expect("open");
        drop(first);
        Store::open(&path).await.expect("reopen");
    }
}
