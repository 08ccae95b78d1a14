use crate::{Store, StoreResult};
use cadre_types::{AgentRegistration, AgentStatus};
use chrono::Utc;
use rusqlite::{params, Row};

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRegistration> {
    Ok(AgentRegistration {
        thread_id: row.get(0)?,
        port: row.get::<_, i64>(1)? as u16,
        pid: row.get::<_, i64>(2)? as u32,
        status: AgentStatus::parse(&row.get::<_, String>(3)?).unwrap_or(AgentStatus::Stopped),
    })
}

impl Store {
    pub async fn upsert_agent(&self, reg: &AgentRegistration) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO agents (thread_id, port, pid, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reg.thread_id,
                reg.port as i64,
                reg.pid as i64,
                reg.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn remove_agent(&self, thread_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM agents WHERE thread_id = ?1", params![thread_id])?;
        Ok(changed > 0)
    }

    pub async fn list_agents(&self) -> StoreResult<Vec<AgentRegistration>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT thread_id, port, pid, status FROM agents ORDER BY thread_id")?;
        let rows = stmt.query_map([], registration_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn list_running_agents(&self) -> StoreResult<Vec<AgentRegistration>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT thread_id, port, pid, status FROM agents
             WHERE status = 'running' ORDER BY thread_id",
        )?;
        let rows = stmt.query_map([], registration_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
