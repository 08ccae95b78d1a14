use crate::{Store, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    pub title: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessageRecord {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        cwd: row.get(2)?,
        model: row.get(3)?,
        archived: row.get::<_, i64>(4)? != 0,
        created_at: parse_ts(row.get::<_, String>(5)?),
        updated_at: parse_ts(row.get::<_, String>(6)?),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Store {
    pub async fn insert_thread(&self, thread: &ThreadRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO threads (id, title, cwd, model, archived, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                thread.id,
                thread.title,
                thread.cwd,
                thread.model,
                thread.archived as i64,
                thread.created_at.to_rfc3339(),
                thread.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_thread(&self, id: &str) -> StoreResult<ThreadRecord> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, title, cwd, model, archived, created_at, updated_at
             FROM threads WHERE id = ?1",
            params![id],
            thread_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("thread {id}")))
    }

    pub async fn list_threads(&self) -> StoreResult<Vec<ThreadRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, cwd, model, archived, created_at, updated_at
             FROM threads ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], thread_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn set_thread_title(&self, id: &str, title: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE threads SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("thread {id}")));
        }
        Ok(())
    }

    pub async fn touch_thread(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE threads SET updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn append_thread_message(&self, msg: &ThreadMessageRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO thread_messages (id, thread_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                msg.id,
                msg.thread_id,
                msg.role,
                msg.content,
                msg.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_thread_messages(
        &self,
        thread_id: &str,
    ) -> StoreResult<Vec<ThreadMessageRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, role, content, created_at
             FROM thread_messages WHERE thread_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![thread_id], |row| {
            Ok(ThreadMessageRecord {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: parse_ts(row.get::<_, String>(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
