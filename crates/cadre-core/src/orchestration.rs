use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub status_header: String,
    pub status_details: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationSnapshot {
    pub running: bool,
    pub runs: HashMap<String, RunState>,
}

/// In-memory map of active orchestration runs. Lifecycle per run:
/// begin → (0..N update) → end.
#[derive(Debug, Default)]
pub struct OrchestrationState {
    active: Mutex<HashMap<String, RunState>>,
}

impl OrchestrationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, run_id: &str, status_header: &str, status_details: &str) {
        self.active.lock().unwrap().insert(
            run_id.to_string(),
            RunState {
                status_header: status_header.to_string(),
                status_details: status_details.to_string(),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn update(&self, run_id: &str, status_header: &str, status_details: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(state) = active.get_mut(run_id) {
            state.status_header = status_header.to_string();
            state.status_details = status_details.to_string();
            state.updated_at = Utc::now();
        }
    }

    pub fn end(&self, run_id: &str) -> bool {
        self.active.lock().unwrap().remove(run_id).is_some()
    }

    pub fn snapshot(&self) -> OrchestrationSnapshot {
        let active = self.active.lock().unwrap();
        OrchestrationSnapshot {
            running: !active.is_empty(),
            runs: active.clone(),
        }
    }
}
