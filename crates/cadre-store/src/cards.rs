use crate::{Store, StoreError, StoreResult};
use cadre_types::{CardRunStatus, CommandCard, CommandCardRun, RiskLevel};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<CommandCard> {
    Ok(CommandCard {
        key: row.get(0)?,
        title: row.get(1)?,
        template: row.get(2)?,
        risk_level: RiskLevel::parse(&row.get::<_, String>(3)?).unwrap_or_default(),
        enabled: row.get::<_, i64>(4)? != 0,
        timeout_sec: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<CommandCardRun> {
    let params_raw: String = row.get(3)?;
    Ok(CommandCardRun {
        id: row.get(0)?,
        card_key: row.get(1)?,
        requested_by: row.get(2)?,
        params: serde_json::from_str(&params_raw).unwrap_or_default(),
        rendered_command: row.get(4)?,
        risk_level: RiskLevel::parse(&row.get::<_, String>(5)?).unwrap_or_default(),
        status: CardRunStatus::parse(&row.get::<_, String>(6)?)
            .unwrap_or(CardRunStatus::Failed),
        requires_review: row.get::<_, i64>(7)? != 0,
        output: row.get(8)?,
        exit_code: row.get::<_, Option<i64>>(9)?.map(|v| v as i32),
        created_at: parse_ts(row.get::<_, String>(10)?),
        updated_at: parse_ts(row.get::<_, String>(11)?),
        executed_at: row.get::<_, Option<String>>(12)?.map(parse_ts),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Store {
    pub async fn upsert_card(&self, card: &CommandCard) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO command_cards (key, title, template, risk_level, enabled, timeout_sec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                card.key,
                card.title,
                card.template,
                card.risk_level.as_str(),
                card.enabled as i64,
                card.timeout_sec.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub async fn get_card(&self, key: &str) -> StoreResult<Option<CommandCard>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT key, title, template, risk_level, enabled, timeout_sec
                 FROM command_cards WHERE key = ?1",
                params![key],
                card_from_row,
            )
            .optional()?)
    }

    pub async fn list_cards(&self) -> StoreResult<Vec<CommandCard>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, title, template, risk_level, enabled, timeout_sec
             FROM command_cards ORDER BY key",
        )?;
        let rows = stmt.query_map([], card_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn insert_card_run(&self, run: &CommandCardRun) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO command_card_runs
             (id, card_key, requested_by, params, rendered_command, risk_level, status,
              requires_review, output, exit_code, created_at, updated_at, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id,
                run.card_key,
                run.requested_by,
                serde_json::to_string(&run.params)?,
                run.rendered_command,
                run.risk_level.as_str(),
                run.status.as_str(),
                run.requires_review as i64,
                run.output,
                run.exit_code.map(|v| v as i64),
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
                run.executed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_card_run(&self, id: &str) -> StoreResult<CommandCardRun> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, card_key, requested_by, params, rendered_command, risk_level, status,
                    requires_review, output, exit_code, created_at, updated_at, executed_at
             FROM command_card_runs WHERE id = ?1",
            params![id],
            run_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("command card run {id}")))
    }

    /// Compare-and-swap on run status. Returns false when the row was not in
    /// `from`; the caller reads the observed status for its policy error.
    pub async fn cas_card_run_status(
        &self,
        id: &str,
        from: CardRunStatus,
        to: CardRunStatus,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE command_card_runs SET status = ?3, updated_at = ?4
             WHERE id = ?1 AND status = ?2",
            params![
                id,
                from.as_str(),
                to.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(changed == 1)
    }

    pub async fn finish_card_run(
        &self,
        id: &str,
        status: CardRunStatus,
        output: &str,
        exit_code: Option<i32>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE command_card_runs
             SET status = ?2, output = ?3, exit_code = ?4, updated_at = ?5, executed_at = ?5
             WHERE id = ?1",
            params![id, status.as_str(), output, exit_code.map(|v| v as i64), now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("command card run {id}")));
        }
        Ok(())
    }

    /// Rows stuck in `running` since before `cutoff` flip to `failed`.
    /// Returns the affected run ids.
    pub async fn fail_stale_card_runs(
        &self,
        cutoff: DateTime<Utc>,
        error_text: &str,
        exit_code: i32,
    ) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id FROM command_card_runs WHERE status = 'running' AND updated_at < ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let now = Utc::now().to_rfc3339();
        for id in &ids {
            conn.execute(
                "UPDATE command_card_runs
                 SET status = 'failed', output = ?2, exit_code = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, error_text, exit_code as i64, now],
            )?;
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run(id: &str, status: CardRunStatus) -> CommandCardRun {
        let now = Utc::now();
        CommandCardRun {
            id: id.to_string(),
            card_key: "echo_greeting".to_string(),
            requested_by: "tester".to_string(),
            params: json!({"name": "world"}),
            rendered_command: "echo 'world'".to_string(),
            risk_level: RiskLevel::Normal,
            status,
            requires_review: false,
            output: String::new(),
            exit_code: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
        }
    }

    #[tokio::test]
    async fn cas_only_moves_from_expected_status() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_card_run(&sample_run("r1", CardRunStatus::Ready))
            .await
            .unwrap();

        assert!(store
            .cas_card_run_status("r1", CardRunStatus::Ready, CardRunStatus::Running)
            .await
            .unwrap());
        // Second transition from ready must fail: the row is now running.
        assert!(!store
            .cas_card_run_status("r1", CardRunStatus::Ready, CardRunStatus::Running)
            .await
            .unwrap());
        let run = store.get_card_run("r1").await.unwrap();
        assert_eq!(run.status, CardRunStatus::Running);
    }

    #[tokio::test]
    async fn stale_running_runs_are_failed() {
        let store = Store::open_in_memory().await.unwrap();
        let mut run = sample_run("r1", CardRunStatus::Running);
        run.updated_at = Utc::now() - chrono::Duration::hours(3);
        store.insert_card_run(&run).await.unwrap();
        store
            .insert_card_run(&sample_run("r2", CardRunStatus::Running))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let failed = store
            .fail_stale_card_runs(cutoff, "[timeout_recovery] stuck", -3)
            .await
            .unwrap();
        assert_eq!(failed, vec!["r1".to_string()]);

        let r1 = store.get_card_run("r1").await.unwrap();
        assert_eq!(r1.status, CardRunStatus::Failed);
        assert_eq!(r1.exit_code, Some(-3));
        assert_eq!(
            store.get_card_run("r2").await.unwrap().status,
            CardRunStatus::Running
        );
    }
}
