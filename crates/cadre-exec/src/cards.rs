use crate::proc::{drain_into, group_command, wait_with_deadline, CapBuf};
use crate::{detect_dangerous, render_template, ExecError, ExecResult};
use cadre_store::Store;
use cadre_types::{
    CardRunStatus, CommandCardRun, ExecOutcome, PrepareResult, ReviewDecision, RiskLevel,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Combined stdout+stderr ceiling persisted per run.
const AGGREGATE_LIMIT: usize = 200 * 1024;
const PER_STREAM_LIMIT: usize = AGGREGATE_LIMIT / 2;
const STDERR_SEPARATOR: &str = "\n--- STDERR ---\n";

const DEFAULT_TIMEOUT_SECS: u64 = 240;
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 3600;

const RECOVERY_EXIT_CODE: i32 = -3;

#[derive(Debug, Clone, Default)]
pub struct RunOneOptions {
    pub auto_approve: bool,
    pub timeout_secs: Option<u64>,
}

/// Prepare → (optional review) → execute pipeline for command cards. Every
/// lifecycle transition lands in the audit log.
pub struct CommandCardExecutor {
    store: Arc<Store>,
}

impl CommandCardExecutor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn prepare(
        &self,
        card_key: &str,
        params: &Value,
        requested_by: &str,
    ) -> ExecResult<PrepareResult> {
        let card_key = card_key.trim();
        if card_key.is_empty() {
            return Err(ExecError::Validation("card key must not be empty".into()));
        }
        let card = self
            .store
            .get_card(card_key)
            .await?
            .ok_or_else(|| ExecError::NotFound(format!("command card {card_key}")))?;
        if !card.enabled {
            return Err(ExecError::Policy(format!(
                "command card {card_key} is disabled"
            )));
        }

        let param_map: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
        let rendered = render_template(&card.template, &param_map)?;

        let dangerous = detect_dangerous(&rendered);
        let requires_review = card.risk_level.forces_review() || dangerous.is_some();
        let status = if requires_review {
            CardRunStatus::PendingReview
        } else {
            CardRunStatus::Ready
        };

        let now = Utc::now();
        let run = CommandCardRun {
            id: Uuid::new_v4().to_string(),
            card_key: card_key.to_string(),
            requested_by: requested_by.to_string(),
            params: Value::Object(param_map),
            rendered_command: rendered.clone(),
            risk_level: card.risk_level,
            status,
            requires_review,
            output: String::new(),
            exit_code: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
        };
        self.store.insert_card_run(&run).await?;
        self.store
            .append_audit(
                requested_by,
                "prepare",
                &run.id,
                json!({
                    "card_key": card_key,
                    "status": status.as_str(),
                    "risk_level": card.risk_level.as_str(),
                    "dangerous_pattern": dangerous,
                }),
            )
            .await?;

        Ok(PrepareResult {
            run_id: run.id,
            status,
            rendered_command: rendered,
            risk_level: card.risk_level,
            requires_review,
            dangerous_pattern: dangerous.map(str::to_string),
        })
    }

    pub async fn review(
        &self,
        run_id: &str,
        decision: ReviewDecision,
        reviewer: &str,
        note: &str,
    ) -> ExecResult<CommandCardRun> {
        let target = match decision {
            ReviewDecision::Approved => CardRunStatus::Ready,
            ReviewDecision::Rejected => CardRunStatus::Rejected,
        };
        let moved = self
            .store
            .cas_card_run_status(run_id, CardRunStatus::PendingReview, target)
            .await?;
        if !moved {
            let run = self.store.get_card_run(run_id).await?;
            return Err(ExecError::Policy(format!(
                "run {run_id} status is {}, expected pending_review",
                run.status.as_str()
            )));
        }
        self.store
            .append_audit(
                reviewer,
                match decision {
                    ReviewDecision::Approved => "review/approved",
                    ReviewDecision::Rejected => "review/rejected",
                },
                run_id,
                json!({ "note": note }),
            )
            .await?;
        Ok(self.store.get_card_run(run_id).await?)
    }

    pub async fn execute(
        &self,
        run_id: &str,
        actor: &str,
        timeout_secs: Option<u64>,
    ) -> ExecResult<ExecOutcome> {
        let moved = self
            .store
            .cas_card_run_status(run_id, CardRunStatus::Ready, CardRunStatus::Running)
            .await?;
        if !moved {
            let run = self.store.get_card_run(run_id).await?;
            return Err(ExecError::Policy(format!(
                "run {run_id} status is {}, expected ready",
                run.status.as_str()
            )));
        }
        let run = self.store.get_card_run(run_id).await?;
        self.store
            .append_audit(actor, "execute", run_id, json!({"command": run.rendered_command}))
            .await?;

        let timeout = effective_timeout(timeout_secs);
        let (output, exit_code, timed_out) =
            run_shell_capped(&run.rendered_command, timeout).await?;

        let success = !timed_out && exit_code == 0;
        let status = if success {
            CardRunStatus::Success
        } else {
            CardRunStatus::Failed
        };
        self.store
            .finish_card_run(run_id, status, &output, Some(exit_code))
            .await?;
        let message = if timed_out {
            format!("command timed out after {}s", timeout.as_secs())
        } else if success {
            String::new()
        } else {
            format!("command exited with code {exit_code}")
        };
        self.store
            .append_audit(
                actor,
                if success { "execute/ok" } else { "execute/failed" },
                run_id,
                json!({ "exit_code": exit_code, "timed_out": timed_out }),
            )
            .await?;

        Ok(ExecOutcome {
            ok: true,
            success,
            exit_code,
            output,
            message,
        })
    }

    /// One-shot prepare + execute. Runs that landed in review are never
    /// executed here: dangerous patterns and high/critical risk must not be
    /// auto-approved, no matter what the caller asked for.
    pub async fn run_one(
        &self,
        card_key: &str,
        params: &Value,
        requested_by: &str,
        opts: RunOneOptions,
    ) -> ExecResult<ExecOutcome> {
        let prepared = self.prepare(card_key, params, requested_by).await?;
        if prepared.status == CardRunStatus::Ready {
            return self
                .execute(&prepared.run_id, requested_by, opts.timeout_secs)
                .await;
        }

        let auto_approvable = opts.auto_approve
            && matches!(prepared.risk_level, RiskLevel::Low | RiskLevel::Normal)
            && prepared.dangerous_pattern.is_none();
        if auto_approvable {
            self.review(&prepared.run_id, ReviewDecision::Approved, requested_by, "auto")
                .await?;
            return self
                .execute(&prepared.run_id, requested_by, opts.timeout_secs)
                .await;
        }

        self.store
            .append_audit(
                requested_by,
                "auto_approve/refused",
                &prepared.run_id,
                json!({
                    "risk_level": prepared.risk_level.as_str(),
                    "dangerous_pattern": prepared.dangerous_pattern,
                }),
            )
            .await?;
        Ok(ExecOutcome {
            ok: true,
            success: false,
            exit_code: -1,
            output: String::new(),
            message: format!(
                "run {} 已进入人工审核队列，危险或高风险命令禁止自动审批",
                prepared.run_id
            ),
        })
    }

    /// Flip runs stuck in `running` beyond twice the execution timeout
    /// (clamped to [300, 7200] seconds) to `failed`.
    pub async fn recover_stale_runs(&self, timeout_secs: u64) -> ExecResult<Vec<String>> {
        let window = (timeout_secs.saturating_mul(2)).clamp(300, 7200);
        let cutoff = Utc::now() - chrono::Duration::seconds(window as i64);
        let failed = self
            .store
            .fail_stale_card_runs(
                cutoff,
                "[timeout_recovery] run stuck in running state",
                RECOVERY_EXIT_CODE,
            )
            .await?;
        for id in &failed {
            self.store
                .append_audit(
                    "system",
                    "recover/timeout",
                    id,
                    json!({ "window_secs": window }),
                )
                .await?;
        }
        Ok(failed)
    }
}

fn effective_timeout(timeout_secs: Option<u64>) -> Duration {
    let secs = match timeout_secs {
        Some(0) | None => DEFAULT_TIMEOUT_SECS,
        Some(secs) => secs,
    };
    Duration::from_secs(secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
}

async fn run_shell_capped(
    command: &str,
    timeout: Duration,
) -> ExecResult<(String, i32, bool)> {
    let mut cmd = group_command("sh");
    cmd.arg("-c").arg(command);
    let mut child = cmd.spawn()?;

    let stdout_buf = Arc::new(Mutex::new(CapBuf::new(PER_STREAM_LIMIT)));
    let stderr_buf = Arc::new(Mutex::new(CapBuf::new(PER_STREAM_LIMIT)));
    let stdout_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(drain_into(s, stdout_buf.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(drain_into(s, stderr_buf.clone())));

    let outcome = wait_with_deadline(child, timeout).await;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let stdout = std::mem::replace(&mut *stdout_buf.lock().unwrap(), CapBuf::new(0)).into_string();
    let stderr = std::mem::replace(&mut *stderr_buf.lock().unwrap(), CapBuf::new(0)).into_string();

    // Per-stream caps keep the aggregate at or under AGGREGATE_LIMIT.
    let mut output = stdout;
    if !stderr.is_empty() {
        output.push_str(STDERR_SEPARATOR);
        output.push_str(&stderr);
    }

    Ok((output, outcome.exit_code, outcome.timed_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_types::CommandCard;
    use serde_json::json;

    async fn executor_with_card(template: &str, risk: RiskLevel) -> CommandCardExecutor {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store
            .upsert_card(&CommandCard {
                key: "test_card".into(),
                title: "Test".into(),
                template: template.into(),
                risk_level: risk,
                enabled: true,
                timeout_sec: None,
            })
            .await
            .unwrap();
        CommandCardExecutor::new(store)
    }

    #[tokio::test]
    async fn happy_path_prepare_execute() {
        let executor = executor_with_card(r#"echo "hello {name}""#, RiskLevel::Normal).await;
        let prepared = executor
            .prepare("test_card", &json!({"name": "world"}), "tester")
            .await
            .unwrap();
        assert_eq!(prepared.status, CardRunStatus::Ready);
        assert_eq!(prepared.rendered_command, r#"echo "hello 'world'""#);
        assert!(!prepared.requires_review);

        let outcome = executor
            .execute(&prepared.run_id, "tester", Some(5))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, "hello 'world'\n");

        let audits = executor.store.list_audit(&prepared.run_id).await.unwrap();
        let actions: Vec<&str> = audits.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(actions, vec!["prepare", "execute", "execute/ok"]);
    }

    #[tokio::test]
    async fn dangerous_template_forces_review_and_refuses_auto_approve() {
        let executor = executor_with_card("rm -rf {path}", RiskLevel::Normal).await;
        let outcome = executor
            .run_one(
                "test_card",
                &json!({"path": "/tmp/x"}),
                "tester",
                RunOneOptions {
                    auto_approve: true,
                    timeout_secs: Some(5),
                },
            )
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.message.contains("禁止自动审批"));

        // The run is parked for a human, not executed.
        let run_id = outcome
            .message
            .split_whitespace()
            .nth(1)
            .expect("message names the run");
        let run = executor.store.get_card_run(run_id).await.unwrap();
        assert_eq!(run.status, CardRunStatus::PendingReview);
        assert!(run.requires_review);
    }

    #[tokio::test]
    async fn high_risk_requires_review_even_when_clean() {
        let executor = executor_with_card("echo {v}", RiskLevel::High).await;
        let prepared = executor
            .prepare("test_card", &json!({"v": "x"}), "tester")
            .await
            .unwrap();
        assert_eq!(prepared.status, CardRunStatus::PendingReview);
        assert!(prepared.dangerous_pattern.is_none());

        let err = executor
            .execute(&prepared.run_id, "tester", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Policy(_)));
        assert!(err.to_string().contains("pending_review"));
    }

    #[tokio::test]
    async fn review_approval_unlocks_execution() {
        let executor = executor_with_card("echo {v}", RiskLevel::High).await;
        let prepared = executor
            .prepare("test_card", &json!({"v": "ok"}), "tester")
            .await
            .unwrap();
        executor
            .review(&prepared.run_id, ReviewDecision::Approved, "reviewer", "lgtm")
            .await
            .unwrap();
        let outcome = executor
            .execute(&prepared.run_id, "tester", Some(5))
            .await
            .unwrap();
        assert!(outcome.success);

        // Re-reviewing an approved run is rejected, not idempotent.
        let err = executor
            .review(&prepared.run_id, ReviewDecision::Approved, "reviewer", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Policy(_)));
    }

    #[tokio::test]
    async fn rejected_runs_never_execute() {
        let executor = executor_with_card("echo {v}", RiskLevel::Critical).await;
        let prepared = executor
            .prepare("test_card", &json!({"v": "x"}), "tester")
            .await
            .unwrap();
        executor
            .review(&prepared.run_id, ReviewDecision::Rejected, "reviewer", "no")
            .await
            .unwrap();
        let err = executor
            .execute(&prepared.run_id, "tester", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn failed_command_keeps_exit_code_and_stderr() {
        let executor =
            executor_with_card("echo visible; echo oops >&2; exit 3", RiskLevel::Normal).await;
        let prepared = executor
            .prepare("test_card", &json!({}), "tester")
            .await
            .unwrap();
        let outcome = executor
            .execute(&prepared.run_id, "tester", Some(5))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.output.contains("visible"));
        assert!(outcome.output.contains("--- STDERR ---"));
        assert!(outcome.output.contains("oops"));
    }

    #[tokio::test]
    async fn missing_card_and_empty_key_are_validation_errors() {
        let executor = executor_with_card("echo {v}", RiskLevel::Normal).await;
        assert!(matches!(
            executor.prepare("", &json!({}), "t").await.unwrap_err(),
            ExecError::Validation(_)
        ));
        assert!(matches!(
            executor.prepare("nope", &json!({}), "t").await.unwrap_err(),
            ExecError::NotFound(_)
        ));
    }
}
