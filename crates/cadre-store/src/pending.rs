use crate::Store;
use cadre_bus::{PendingMessage, PendingStore};
use cadre_types::BusMessage;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;

/// `bus_pending` table adapter used by the resilient publisher.
pub struct SqlitePendingStore {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn pending_store(&self) -> SqlitePendingStore {
        SqlitePendingStore { conn: self.conn() }
    }
}

#[async_trait::async_trait]
impl PendingStore for SqlitePendingStore {
    async fn enqueue(&self, msg: &BusMessage) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(msg)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO bus_pending (seq, topic, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                msg.seq as i64,
                msg.topic,
                encoded,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn load_batch(&self, limit: usize) -> anyhow::Result<Vec<PendingMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, message FROM bus_pending ORDER BY seq ASC, id ASC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((id, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            match serde_json::from_str::<BusMessage>(&raw) {
                Ok(message) => out.push(PendingMessage { id, message }),
                Err(err) => {
                    // A poison row would wedge the whole recovery loop; drop it.
                    tracing::warn!(id, error = %err, "discarding undecodable pending message");
                    conn.execute("DELETE FROM bus_pending WHERE id = ?1", params![id])?;
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM bus_pending WHERE id = ?1", params![id])?;
        Ok(())
    }
}
