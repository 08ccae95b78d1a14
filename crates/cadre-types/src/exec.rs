use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl RiskLevel {
    pub fn forces_review(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Normal => "normal",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(RiskLevel::Low),
            "normal" => Some(RiskLevel::Normal),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardRunStatus {
    Ready,
    PendingReview,
    Running,
    Success,
    Failed,
    Rejected,
}

impl CardRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CardRunStatus::Ready => "ready",
            CardRunStatus::PendingReview => "pending_review",
            CardRunStatus::Running => "running",
            CardRunStatus::Success => "success",
            CardRunStatus::Failed => "failed",
            CardRunStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(CardRunStatus::Ready),
            "pending_review" => Some(CardRunStatus::PendingReview),
            "running" => Some(CardRunStatus::Running),
            "success" => Some(CardRunStatus::Success),
            "failed" => Some(CardRunStatus::Failed),
            "rejected" => Some(CardRunStatus::Rejected),
            _ => None,
        }
    }
}

/// A declarative, template-based shell invocation with risk classification
/// and optional human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCard {
    pub key: String,
    #[serde(default)]
    pub title: String,
    /// Template with `{ident}` placeholders, identifier = `[A-Za-z_]\w*`.
    pub template: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCardRun {
    pub id: String,
    pub card_key: String,
    pub requested_by: String,
    #[serde(default)]
    pub params: Value,
    pub rendered_command: String,
    pub risk_level: RiskLevel,
    pub status: CardRunStatus,
    pub requires_review: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareResult {
    pub run_id: String,
    pub status: CardRunStatus,
    pub rendered_command: String,
    pub risk_level: RiskLevel,
    pub requires_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dangerous_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

/// Structured outcome handed back to callers. `ok` reflects whether the
/// overall operation completed, not whether the command succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub ok: bool,
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Test,
    ProjectCmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Go,
    Javascript,
    Typescript,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub mode: RunMode,
    /// Ignored for `project_cmd`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub truncated: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Audit record emitted on every command-card lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub subject: String,
    #[serde(default)]
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}
