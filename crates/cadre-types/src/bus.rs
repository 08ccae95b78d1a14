use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known message types carried on the bus. Consumers match on these
/// constants rather than free-form strings.
pub mod message_type {
    pub const TASK_DELEGATE: &str = "task_delegate";
    pub const AGENT_OUTPUT: &str = "agent_output";
    pub const AGENT_EXEC: &str = "agent_exec";
    pub const AGENT_ERROR: &str = "agent_error";
    pub const AGENT_LIFECYCLE: &str = "agent_lifecycle";
    pub const AGENT_EVENT: &str = "agent_event";
    pub const BROADCAST: &str = "broadcast";
    pub const SYSTEM: &str = "system";
}

/// The unit of pub/sub. `seq` is assigned by the bus at publish time and is
/// strictly increasing across all successful publishes of one bus instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    #[serde(default)]
    pub from: String,
    /// A specific subscriber id or `"*"`.
    #[serde(default = "default_to")]
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Structured payload. Always an object on the wire; `null` payloads
    /// serialize to an empty object.
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Milliseconds since epoch. Stamped by the bus when zero.
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub seq: u64,
}

fn default_to() -> String {
    "*".to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            topic: topic.into(),
            from: String::new(),
            to: "*".to_string(),
            kind: kind.into(),
            payload: payload.unwrap_or_else(empty_object),
            timestamp_ms: 0,
            seq: 0,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }
}

/// Topic filter rule: accept iff the filter is `"*"`, the topic equals the
/// filter, or the topic extends the filter across a `.` boundary. No regex,
/// no glob: `agent.a0` matches `agent.a0.output` but never `agent.a01`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == "*" {
        return true;
    }
    if topic == filter {
        return true;
    }
    topic.len() > filter.len()
        && topic.starts_with(filter)
        && topic.as_bytes()[filter.len()] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        assert!(topic_matches("*", "agent.a0.output"));
        assert!(topic_matches("*", ""));
    }

    #[test]
    fn exact_and_prefix_match() {
        assert!(topic_matches("agent.a0", "agent.a0"));
        assert!(topic_matches("agent.a0", "agent.a0.output"));
        assert!(topic_matches("agent", "agent.a0.output"));
    }

    #[test]
    fn sibling_prefix_does_not_match() {
        assert!(!topic_matches("agent.a0", "agent.a01"));
        assert!(!topic_matches("agent.a0", "agent.a01.output"));
        assert!(!topic_matches("agent.a0.output", "agent.a0"));
    }

    #[test]
    fn null_payload_deserializes_to_empty_object() {
        let msg: BusMessage =
            serde_json::from_str(r#"{"topic":"t","type":"system"}"#).expect("parse");
        assert_eq!(msg.payload, serde_json::json!({}));
        assert_eq!(msg.to, "*");
    }
}
