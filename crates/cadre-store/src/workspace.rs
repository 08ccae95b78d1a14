use crate::{Store, StoreError, StoreResult};
use cadre_types::{WorkspaceFileRow, WorkspaceFileState, WorkspaceRun, WorkspaceRunStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceRun> {
    let metadata_raw: String = row.get(5)?;
    Ok(WorkspaceRun {
        run_key: row.get(0)?,
        dag_key: row.get(1)?,
        source_root: row.get(2)?,
        workspace_path: row.get(3)?,
        status: WorkspaceRunStatus::parse(&row.get::<_, String>(4)?)
            .unwrap_or(WorkspaceRunStatus::Failed),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
        created_at: parse_ts(row.get::<_, String>(6)?),
        updated_at: parse_ts(row.get::<_, String>(7)?),
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceFileRow> {
    Ok(WorkspaceFileRow {
        run_key: row.get(0)?,
        relative_path: row.get(1)?,
        baseline_sha256: row.get(2)?,
        workspace_sha256: row.get(3)?,
        source_sha256_before: row.get(4)?,
        source_sha256_after: row.get(5)?,
        state: WorkspaceFileState::parse(&row.get::<_, String>(6)?)
            .unwrap_or(WorkspaceFileState::Error),
        last_error: row.get(7)?,
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Store {
    pub async fn insert_workspace_run(&self, run: &WorkspaceRun) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workspace_runs
             (run_key, dag_key, source_root, workspace_path, status, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_key,
                run.dag_key,
                run.source_root,
                run.workspace_path,
                run.status.as_str(),
                serde_json::to_string(&run.metadata)?,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_workspace_run(&self, run_key: &str) -> StoreResult<WorkspaceRun> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT run_key, dag_key, source_root, workspace_path, status, metadata, created_at, updated_at
             FROM workspace_runs WHERE run_key = ?1",
            params![run_key],
            run_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("workspace run {run_key}")))
    }

    pub async fn list_workspace_runs(&self) -> StoreResult<Vec<WorkspaceRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_key, dag_key, source_root, workspace_path, status, metadata, created_at, updated_at
             FROM workspace_runs ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// DB-level compare-and-swap so parallel merges on one run race in the
    /// store, not in process memory. Returns false when the row was not in
    /// `from`.
    pub async fn cas_workspace_run_status(
        &self,
        run_key: &str,
        from: WorkspaceRunStatus,
        to: WorkspaceRunStatus,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workspace_runs SET status = ?3, updated_at = ?4
             WHERE run_key = ?1 AND status = ?2",
            params![
                run_key,
                from.as_str(),
                to.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(changed == 1)
    }

    pub async fn set_workspace_run_status(
        &self,
        run_key: &str,
        status: WorkspaceRunStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workspace_runs SET status = ?2, updated_at = ?3 WHERE run_key = ?1",
            params![run_key, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("workspace run {run_key}")));
        }
        Ok(())
    }

    pub async fn upsert_workspace_file(&self, file: &WorkspaceFileRow) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO workspace_files
             (run_key, relative_path, baseline_sha256, workspace_sha256,
              source_sha256_before, source_sha256_after, state, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                file.run_key,
                file.relative_path,
                file.baseline_sha256,
                file.workspace_sha256,
                file.source_sha256_before,
                file.source_sha256_after,
                file.state.as_str(),
                file.last_error,
            ],
        )?;
        Ok(())
    }

    pub async fn list_workspace_files(&self, run_key: &str) -> StoreResult<Vec<WorkspaceFileRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_key, relative_path, baseline_sha256, workspace_sha256,
                    source_sha256_before, source_sha256_after, state, last_error
             FROM workspace_files WHERE run_key = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![run_key], file_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn delete_workspace_file(
        &self,
        run_key: &str,
        relative_path: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM workspace_files WHERE run_key = ?1 AND relative_path = ?2",
            params![run_key, relative_path],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run(key: &str) -> WorkspaceRun {
        let now = Utc::now();
        WorkspaceRun {
            run_key: key.to_string(),
            dag_key: "dag-1".to_string(),
            source_root: "/src".to_string(),
            workspace_path: "/ws".to_string(),
            status: WorkspaceRunStatus::Active,
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn parallel_cas_yields_one_winner() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_workspace_run(&sample_run("r1")).await.unwrap();

        let first = store
            .cas_workspace_run_status("r1", WorkspaceRunStatus::Active, WorkspaceRunStatus::Merging)
            .await
            .unwrap();
        let second = store
            .cas_workspace_run_status("r1", WorkspaceRunStatus::Active, WorkspaceRunStatus::Merging)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(
            store.get_workspace_run("r1").await.unwrap().status,
            WorkspaceRunStatus::Merging
        );
    }

    #[tokio::test]
    async fn file_rows_upsert_by_composite_key() {
        let store = Store::open_in_memory().await.unwrap();
        let mut row = WorkspaceFileRow {
            run_key: "r1".to_string(),
            relative_path: "a.txt".to_string(),
            baseline_sha256: "h1".to_string(),
            workspace_sha256: "h1".to_string(),
            source_sha256_before: "h1".to_string(),
            source_sha256_after: "h1".to_string(),
            state: WorkspaceFileState::Synced,
            last_error: None,
        };
        store.upsert_workspace_file(&row).await.unwrap();
        row.state = WorkspaceFileState::Conflict;
        store.upsert_workspace_file(&row).await.unwrap();

        let files = store.list_workspace_files("r1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].state, WorkspaceFileState::Conflict);
    }
}
