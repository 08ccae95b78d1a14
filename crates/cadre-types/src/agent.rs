use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(AgentStatus::Starting),
            "running" => Some(AgentStatus::Running),
            "stopping" => Some(AgentStatus::Stopping),
            "stopped" => Some(AgentStatus::Stopped),
            "failed" => Some(AgentStatus::Failed),
            _ => None,
        }
    }
}

/// Service-registry row for a running agent, addressable by `thread_id` and
/// reachable through its registered port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub thread_id: String,
    pub port: u16,
    pub pid: u32,
    pub status: AgentStatus,
}

/// Raw event read off a child agent's event stream before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAgentEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Bus sub-topic an agent event is routed to, derived from its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventTopic {
    Output,
    Exec,
    Error,
    Lifecycle,
    Event,
}

impl AgentEventTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentEventTopic::Output => "output",
            AgentEventTopic::Exec => "exec",
            AgentEventTopic::Error => "error",
            AgentEventTopic::Lifecycle => "lifecycle",
            AgentEventTopic::Event => "event",
        }
    }
}

/// Classify a raw agent event method into its bus sub-topic.
pub fn classify_agent_event(method: &str) -> AgentEventTopic {
    if method == "error" || method.ends_with("/error") {
        return AgentEventTopic::Error;
    }
    if method.contains("commandExecution") || method.contains("/exec") {
        return AgentEventTopic::Exec;
    }
    if method.starts_with("thread/")
        || method.starts_with("turn/")
        || method.starts_with("account/")
    {
        return AgentEventTopic::Lifecycle;
    }
    if method.starts_with("item/") {
        return AgentEventTopic::Output;
    }
    AgentEventTopic::Event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_the_known_kinds() {
        assert_eq!(classify_agent_event("error"), AgentEventTopic::Error);
        assert_eq!(
            classify_agent_event("item/commandExecution/outputDelta"),
            AgentEventTopic::Exec
        );
        assert_eq!(
            classify_agent_event("turn/started"),
            AgentEventTopic::Lifecycle
        );
        assert_eq!(
            classify_agent_event("item/agentMessage/delta"),
            AgentEventTopic::Output
        );
        assert_eq!(
            classify_agent_event("ui/state/changed"),
            AgentEventTopic::Event
        );
    }
}
