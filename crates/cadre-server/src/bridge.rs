use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// One outbound UI envelope: `event` is the transport-level event name,
/// `data` the structured payload (never a serialized string).
#[derive(Debug, Clone)]
pub struct BridgeEnvelope {
    pub event: &'static str,
    pub data: Value,
}

const DELTA_LOG_SAMPLE: u64 = 200;

/// Builds and fans out UI envelopes for every normalized notification: one
/// `bridge-event` always, plus a compatibility `agent-event` when the
/// payload names a thread. Both share a single serialization of the
/// payload. Emission logs are sampled for delta methods so streaming does
/// not produce log storms.
pub struct BridgeEmitter {
    tx: broadcast::Sender<BridgeEnvelope>,
    delta_counters: Mutex<HashMap<String, u64>>,
}

impl BridgeEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            tx,
            delta_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEnvelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit(&self, method: &str, params: &Value) {
        let envelopes = build_envelopes(method, params);
        self.log_emission(method, envelopes.len());
        for envelope in envelopes {
            let _ = self.tx.send(envelope);
        }
    }

    fn log_emission(&self, method: &str, count: usize) {
        if method.contains("delta") || method.contains("Delta") {
            let n = {
                let mut counters = self.delta_counters.lock().unwrap();
                let counter = counters.entry(method.to_string()).or_insert(0);
                *counter += 1;
                *counter
            };
            if n % DELTA_LOG_SAMPLE != 1 {
                return;
            }
            tracing::debug!(method, count, seen = n, "bridge emit (sampled)");
        } else {
            tracing::debug!(method, count, "bridge emit");
        }
    }
}

/// The single envelope builder. The payload object is shared by both
/// envelopes; nothing is double-serialized.
pub fn build_envelopes(method: &str, params: &Value) -> Vec<BridgeEnvelope> {
    let mut out = vec![BridgeEnvelope {
        event: "bridge-event",
        data: json!({ "type": method, "payload": params }),
    }];
    let thread_id = params
        .get("threadId")
        .or_else(|| params.get("thread_id"))
        .and_then(|v| v.as_str());
    if let Some(thread_id) = thread_id {
        out.push(BridgeEnvelope {
            event: "agent-event",
            data: json!({ "agent_id": thread_id, "type": method, "payload": params }),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_scoped_payloads_get_both_envelopes() {
        let envelopes = build_envelopes("turn/started", &json!({"threadId": "t1"}));
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].event, "bridge-event");
        assert_eq!(envelopes[0].data["type"], "turn/started");
        assert_eq!(envelopes[1].event, "agent-event");
        assert_eq!(envelopes[1].data["agent_id"], "t1");
        // Payload is a structured object, not a string.
        assert!(envelopes[0].data["payload"].is_object());
    }

    #[test]
    fn threadless_payloads_get_only_the_bridge_envelope() {
        let envelopes = build_envelopes("engine/ready", &json!({"ok": true}));
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].event, "bridge-event");
    }

    #[tokio::test]
    async fn emitter_delivers_to_subscribers() {
        let emitter = BridgeEmitter::new(64);
        let mut rx = emitter.subscribe();
        emitter.emit("turn/completed", &json!({"threadId": "t1", "turnId": "x"}));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, "bridge-event");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, "agent-event");
    }
}
