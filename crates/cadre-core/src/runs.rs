use cadre_types::now_ms;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    #[serde(rename = "runID")]
    pub run_id: String,
    #[serde(rename = "startedAtMs")]
    pub started_at_ms: u64,
    #[serde(rename = "lastActivityAtMs")]
    pub last_activity_at_ms: u64,
    #[serde(rename = "agentID", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Single-flight guard for turn starts: one active run per thread. Losing
/// acquirers get the existing run back.
#[derive(Clone, Default)]
pub struct RunRegistry {
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, thread_id: &str) -> Option<ActiveRun> {
        self.active.read().await.get(thread_id).cloned()
    }

    pub async fn acquire(
        &self,
        thread_id: &str,
        run_id: String,
        agent_id: Option<String>,
    ) -> Result<ActiveRun, ActiveRun> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(thread_id).cloned() {
            return Err(existing);
        }
        let now = now_ms();
        let run = ActiveRun {
            run_id,
            started_at_ms: now,
            last_activity_at_ms: now,
            agent_id,
        };
        guard.insert(thread_id.to_string(), run.clone());
        Ok(run)
    }

    pub async fn touch(&self, thread_id: &str, run_id: &str) {
        let mut guard = self.active.write().await;
        if let Some(run) = guard.get_mut(thread_id) {
            if run.run_id == run_id {
                run.last_activity_at_ms = now_ms();
            }
        }
    }

    pub async fn finish_if_match(&self, thread_id: &str, run_id: &str) -> Option<ActiveRun> {
        let mut guard = self.active.write().await;
        if guard.get(thread_id).map(|r| r.run_id.as_str()) == Some(run_id) {
            return guard.remove(thread_id);
        }
        None
    }

    pub async fn finish_active(&self, thread_id: &str) -> Option<ActiveRun> {
        self.active.write().await.remove(thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_single_flight_per_thread() {
        let registry = RunRegistry::new();
        let first = registry
            .acquire("t1", "run-1".into(), None)
            .await
            .expect("first acquire wins");
        let second = registry.acquire("t1", "run-2".into(), None).await;
        match second {
            Err(existing) => assert_eq!(existing.run_id, first.run_id),
            Ok(_) => panic!("second acquire must observe the active run"),
        }

        assert!(registry.finish_if_match("t1", "run-2").await.is_none());
        assert!(registry.finish_if_match("t1", "run-1").await.is_some());
        assert!(registry.acquire("t1", "run-3".into(), None).await.is_ok());
    }
}
