use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized notification consumed by the conversation state machine and
/// fanned out to UIs. The `method` string is the discriminator; `params` is
/// always a structured object, never a serialized string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.params
            .get("threadId")
            .or_else(|| self.params.get("thread_id"))
            .and_then(|v| v.as_str())
    }

    pub fn turn_id(&self) -> Option<&str> {
        self.params
            .get("turnId")
            .or_else(|| self.params.get("turn_id"))
            .and_then(|v| v.as_str())
    }

    pub fn item_id(&self) -> Option<&str> {
        self.params
            .get("itemId")
            .or_else(|| self.params.get("item_id"))
            .or_else(|| self.params.get("id"))
            .and_then(|v| v.as_str())
    }
}

/// Notification methods understood by the state machine.
pub mod method {
    pub const THREAD_STARTED: &str = "thread/started";
    pub const TURN_STARTED: &str = "turn/started";
    pub const TURN_COMPLETED: &str = "turn/completed";
    pub const TURN_CANCELLED: &str = "turn/cancelled";
    pub const TURN_PLAN_UPDATED: &str = "turn/plan/updated";
    pub const TURN_DIFF_UPDATED: &str = "turn/diff/updated";
    pub const ITEM_STARTED: &str = "item/started";
    pub const ITEM_COMPLETED: &str = "item/completed";
    pub const AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";
    pub const REASONING_SUMMARY_DELTA: &str = "item/reasoning/summaryTextDelta";
    pub const REASONING_CONTENT_DELTA: &str = "item/reasoning/contentTextDelta";
    pub const COMMAND_OUTPUT_DELTA: &str = "item/commandExecution/outputDelta";
    pub const COMMAND_REQUEST_APPROVAL: &str = "item/commandExecution/requestApproval";
    pub const FILE_CHANGE_REQUEST_APPROVAL: &str = "item/fileChange/requestApproval";
    pub const TOOL_REQUEST_USER_INPUT: &str = "item/tool/requestUserInput";
    pub const TOKEN_USAGE_UPDATED: &str = "thread/tokenUsage/updated";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    InProgress,
    Completed,
    Cancelled,
    Error,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TurnStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResumeState {
    Resumed,
    Resuming,
}

/// A typed fragment of a turn. Items are addressed by `id` within their turn
/// and upserted as events arrive; text-bearing variants accumulate deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnItem {
    pub id: String,
    #[serde(flatten)]
    pub detail: TurnItemDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnItemDetail {
    UserMessage {
        #[serde(default)]
        text: String,
    },
    AssistantMessage {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    ToolResult {
        tool: String,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileChange {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    TerminalCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        aggregated_output: String,
    },
    TerminalOutput {
        #[serde(default)]
        text: String,
    },
    ApprovalRequest {
        kind: ApprovalKind,
        #[serde(default)]
        reason: String,
    },
    ContextCompaction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    SystemMessage {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<String>,
        #[serde(default)]
        content: Vec<String>,
    },
    Plan {
        #[serde(default)]
        text: String,
    },
    TodoList {
        #[serde(default)]
        items: Vec<TodoItem>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
    CommandExecution,
    FileChange,
    ToolInput,
}

/// Pending approval or tool-input request. Stored by id on the conversation,
/// not on the item, so its lifecycle does not depend on item identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRequest {
    pub id: String,
    pub kind: ApprovalKind,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    Accept,
    AcceptForSession,
    Decline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One user prompt and the agent's full response pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    /// Unknown between the local `turn/start` request and the server's
    /// `turn/started` notification; reconciled by latest-turn fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub status: TurnStatus,
    pub turn_started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_assistant_started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default)]
    pub items: Vec<TurnItem>,
}

impl Turn {
    pub fn new(turn_id: Option<String>, started_at_ms: u64) -> Self {
        Self {
            turn_id,
            status: TurnStatus::InProgress,
            turn_started_at_ms: started_at_ms,
            final_assistant_started_at_ms: None,
            error: None,
            diff: None,
            items: Vec::new(),
        }
    }

    pub fn item(&self, id: &str) -> Option<&TurnItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

/// Per-thread state consumed by UIs and peers. Append-only in turns;
/// individual turn fields are mutated by normalized events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub requests: Vec<PendingRequest>,
    pub resume_state: ResumeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_collaboration_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_token_usage_info: Option<TokenUsageInfo>,
    #[serde(default)]
    pub has_unread_turn: bool,
    #[serde(default)]
    pub is_streaming: bool,
}

impl Conversation {
    pub fn new(id: impl Into<String>, cwd: Option<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
            requests: Vec::new(),
            resume_state: ResumeState::Resumed,
            cwd,
            latest_model: None,
            latest_collaboration_mode: None,
            latest_token_usage_info: None,
            has_unread_turn: false,
            is_streaming: false,
        }
    }

    pub fn latest_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn in_progress_turn(&self) -> Option<&Turn> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.status == TurnStatus::InProgress)
    }
}

/// Enumerated collaboration options. Free strings are rejected at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Suggest,
    AutoEdit,
    FullAuto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxPolicy {
    Sandbox,
    NoSandbox,
}
