use crate::{Store, StoreResult};
use cadre_types::AuditRecord;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;
use uuid::Uuid;

impl Store {
    pub async fn append_audit(
        &self,
        actor: &str,
        action: &str,
        subject: &str,
        detail: Value,
    ) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (id, actor, action, subject, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                actor,
                action,
                subject,
                serde_json::to_string(&detail)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub async fn list_audit(&self, subject: &str) -> StoreResult<Vec<AuditRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, actor, action, subject, detail, created_at
             FROM audit_log WHERE subject = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![subject], |row| {
            let detail_raw: String = row.get(4)?;
            Ok(AuditRecord {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                subject: row.get(3)?,
                detail: serde_json::from_str(&detail_raw).unwrap_or_default(),
                created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(5)?)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn audit_rows_are_appended_per_subject() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .append_audit("tester", "prepare", "run-1", json!({"card": "echo"}))
            .await
            .unwrap();
        store
            .append_audit("tester", "execute", "run-1", json!({"exit_code": 0}))
            .await
            .unwrap();
        store
            .append_audit("tester", "prepare", "run-2", json!({}))
            .await
            .unwrap();

        let rows = store.list_audit("run-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "prepare");
        assert_eq!(rows[1].action, "execute");
    }
}
