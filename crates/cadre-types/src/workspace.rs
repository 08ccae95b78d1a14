use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceRunStatus {
    Active,
    Merging,
    Merged,
    Aborted,
    Failed,
}

impl WorkspaceRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceRunStatus::Active => "active",
            WorkspaceRunStatus::Merging => "merging",
            WorkspaceRunStatus::Merged => "merged",
            WorkspaceRunStatus::Aborted => "aborted",
            WorkspaceRunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(WorkspaceRunStatus::Active),
            "merging" => Some(WorkspaceRunStatus::Merging),
            "merged" => Some(WorkspaceRunStatus::Merged),
            "aborted" => Some(WorkspaceRunStatus::Aborted),
            "failed" => Some(WorkspaceRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceFileState {
    Tracked,
    Synced,
    Changed,
    Merged,
    Conflict,
    Error,
    Unchanged,
}

impl WorkspaceFileState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceFileState::Tracked => "tracked",
            WorkspaceFileState::Synced => "synced",
            WorkspaceFileState::Changed => "changed",
            WorkspaceFileState::Merged => "merged",
            WorkspaceFileState::Conflict => "conflict",
            WorkspaceFileState::Error => "error",
            WorkspaceFileState::Unchanged => "unchanged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tracked" => Some(WorkspaceFileState::Tracked),
            "synced" => Some(WorkspaceFileState::Synced),
            "changed" => Some(WorkspaceFileState::Changed),
            "merged" => Some(WorkspaceFileState::Merged),
            "conflict" => Some(WorkspaceFileState::Conflict),
            "error" => Some(WorkspaceFileState::Error),
            "unchanged" => Some(WorkspaceFileState::Unchanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRun {
    pub run_key: String,
    #[serde(default)]
    pub dag_key: String,
    pub source_root: String,
    pub workspace_path: String,
    pub status: WorkspaceRunStatus,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per `(run_key, relative_path)` hash ledger. All four hash slots equal
/// right after bootstrap; drift between them drives merge decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceFileRow {
    pub run_key: String,
    pub relative_path: String,
    #[serde(default)]
    pub baseline_sha256: String,
    #[serde(default)]
    pub workspace_sha256: String,
    #[serde(default)]
    pub source_sha256_before: String,
    #[serde(default)]
    pub source_sha256_after: String,
    pub state: WorkspaceFileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCreateRequest {
    pub run_key: String,
    #[serde(default)]
    pub dag_key: String,
    pub source_root: String,
    /// Relative paths to seed into the workspace from the source root.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMergeRequest {
    pub run_key: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub delete_removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeFileOutcome {
    pub path: String,
    /// One of `merged`, `would_merge`, `conflict`, `unchanged`, `deleted`,
    /// `would_delete`, `error`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub merged: usize,
    pub conflicts: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub errors: usize,
    #[serde(default)]
    pub files: Vec<MergeFileOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkspaceRunStatus>,
}
