use crate::{pid_alive, AgentError, AgentResult};
use cadre_bus::ResilientPublisher;
use cadre_store::Store;
use cadre_types::{classify_agent_event, message_type, AgentRegistration, RawAgentEvent};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Service discovery over the agent registry table.
#[async_trait::async_trait]
pub trait AgentDiscoverer: Send + Sync {
    async fn running_agents(&self) -> AgentResult<Vec<AgentRegistration>>;
}

pub struct StoreDiscoverer {
    store: Arc<Store>,
}

impl StoreDiscoverer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl AgentDiscoverer for StoreDiscoverer {
    async fn running_agents(&self) -> AgentResult<Vec<AgentRegistration>> {
        Ok(self.store.list_running_agents().await?)
    }
}

/// Per-thread ingress client, cached by the router and reused while the
/// agent keeps running.
struct AgentClient {
    registration: AgentRegistration,
    http: reqwest::Client,
}

impl AgentClient {
    fn new(registration: AgentRegistration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self { registration, http }
    }

    async fn submit(&self, prompt: &str, images: &[String], files: &[String]) -> AgentResult<()> {
        let url = format!("http://127.0.0.1:{}/submit", self.registration.port);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "prompt": prompt, "images": images, "files": files }))
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Transport(format!(
                "ingress of {} returned status {}",
                self.registration.thread_id,
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Resolves target agents through discovery and forwards directed
/// messages, leaving an audit trail on the bus.
pub struct AgentRouter {
    discoverer: Arc<dyn AgentDiscoverer>,
    publisher: Arc<ResilientPublisher>,
    clients: Mutex<HashMap<String, Arc<AgentClient>>>,
}

impl AgentRouter {
    pub fn new(discoverer: Arc<dyn AgentDiscoverer>, publisher: Arc<ResilientPublisher>) -> Self {
        Self {
            discoverer,
            publisher,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve_client(&self, thread_id: &str) -> AgentResult<Arc<AgentClient>> {
        if let Some(client) = self.cached_running(thread_id) {
            return Ok(client);
        }

        let registration = self
            .discoverer
            .running_agents()
            .await?
            .into_iter()
            .find(|r| r.thread_id == thread_id)
            .ok_or_else(|| AgentError::NotFound(thread_id.to_string()))?;

        // Double-checked: another caller may have created the client while
        // we were querying discovery.
        let mut clients = self.clients.lock().unwrap();
        if let Some(existing) = clients.get(thread_id) {
            if pid_alive(existing.registration.pid) {
                return Ok(existing.clone());
            }
        }
        let client = Arc::new(AgentClient::new(registration));
        clients.insert(thread_id.to_string(), client.clone());
        Ok(client)
    }

    fn cached_running(&self, thread_id: &str) -> Option<Arc<AgentClient>> {
        let clients = self.clients.lock().unwrap();
        let client = clients.get(thread_id)?;
        if pid_alive(client.registration.pid) {
            Some(client.clone())
        } else {
            None
        }
    }

    /// Post the prompt to the target's ingress, then record a
    /// `task_delegate` message on `agent.<to>.input`.
    pub async fn delegate_task(
        &self,
        from_id: &str,
        to_id: &str,
        prompt: &str,
        images: &[String],
        files: &[String],
    ) -> AgentResult<()> {
        let client = self.resolve_client(to_id).await?;
        client.submit(prompt, images, files).await?;
        self.publisher
            .publish_from(
                "agent",
                &format!("{to_id}.input"),
                from_id,
                message_type::TASK_DELEGATE,
                Some(json!({
                    "prompt": prompt,
                    "images": images,
                    "files": files,
                })),
            )
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(())
    }

    pub async fn send_to_agent(&self, thread_id: &str, prompt: &str) -> AgentResult<()> {
        let client = self.resolve_client(thread_id).await?;
        client.submit(prompt, &[], &[]).await
    }

    /// Deliver the prompt to every running agent except the sender.
    /// Individual failures are logged and do not stop the fanout.
    pub async fn broadcast(&self, from_id: &str, prompt: &str) -> AgentResult<usize> {
        let agents = self.discoverer.running_agents().await?;
        let mut delivered = 0;
        for registration in agents {
            if registration.thread_id == from_id {
                continue;
            }
            match self.send_to_agent(&registration.thread_id, prompt).await {
                Ok(()) => {
                    delivered += 1;
                    let _ = self
                        .publisher
                        .publish_from(
                            "agent",
                            &format!("{}.input", registration.thread_id),
                            from_id,
                            message_type::BROADCAST,
                            Some(json!({ "prompt": prompt })),
                        )
                        .await;
                }
                Err(err) => {
                    tracing::warn!(
                        thread_id = %registration.thread_id,
                        error = %err,
                        "broadcast delivery failed"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Map a raw agent event onto its bus sub-topic and publish it as
    /// `agent.<id>.<subtopic>`.
    pub async fn publish_agent_event(&self, agent_id: &str, event: RawAgentEvent) -> AgentResult<()> {
        let subtopic = classify_agent_event(&event.method);
        let kind = match subtopic {
            cadre_types::AgentEventTopic::Output => message_type::AGENT_OUTPUT,
            cadre_types::AgentEventTopic::Exec => message_type::AGENT_EXEC,
            cadre_types::AgentEventTopic::Error => message_type::AGENT_ERROR,
            cadre_types::AgentEventTopic::Lifecycle => message_type::AGENT_LIFECYCLE,
            cadre_types::AgentEventTopic::Event => message_type::AGENT_EVENT,
        };
        self.publisher
            .publish_from(
                "agent",
                &format!("{agent_id}.{}", subtopic.as_str()),
                agent_id,
                kind,
                Some(json!({ "method": event.method, "params": event.params })),
            )
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    pub async fn list_agents(&self) -> AgentResult<Vec<AgentRegistration>> {
        self.discoverer.running_agents().await
    }

    /// Drop cached clients whose processes are gone.
    pub fn cleanup_stale(&self) -> usize {
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|_, client| pid_alive(client.registration.pid));
        before - clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_bus::MessageBus;
    use cadre_types::AgentStatus;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FixedDiscoverer {
        agents: Vec<AgentRegistration>,
    }

    #[async_trait::async_trait]
    impl AgentDiscoverer for FixedDiscoverer {
        async fn running_agents(&self) -> AgentResult<Vec<AgentRegistration>> {
            Ok(self.agents.clone())
        }
    }

    #[derive(Default)]
    struct NoopPending;

    #[async_trait::async_trait]
    impl cadre_bus::PendingStore for NoopPending {
        async fn enqueue(&self, _msg: &cadre_types::BusMessage) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load_batch(&self, _limit: usize) -> anyhow::Result<Vec<cadre_bus::PendingMessage>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _id: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn request_complete(data: &[u8]) -> bool {
        let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&data[..header_end]);
        let content_length = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        data.len() >= header_end + 4 + content_length
    }

    /// Minimal one-shot ingress: accepts HTTP POSTs and answers 204.
    async fn fake_ingress(accepted: Arc<AtomicBool>) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    // Read until the request (headers + body) has fully
                    // arrived before answering.
                    let mut data = Vec::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        let Ok(n) = socket.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if request_complete(&data) {
                            break;
                        }
                    }
                    accepted.store(true, Ordering::Relaxed);
                    let _ = socket
                        .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        port
    }

    fn router_with(
        agents: Vec<AgentRegistration>,
        bus: Arc<MessageBus>,
    ) -> AgentRouter {
        let publisher = Arc::new(ResilientPublisher::new(bus, Arc::new(NoopPending)));
        AgentRouter::new(Arc::new(FixedDiscoverer { agents }), publisher)
    }

    #[tokio::test]
    async fn delegate_reaches_ingress_and_audits_on_the_bus() {
        let accepted = Arc::new(AtomicBool::new(false));
        let port = fake_ingress(accepted.clone()).await;
        let bus = Arc::new(MessageBus::new());
        let mut sub = bus.subscribe("watcher", "*");
        let router = router_with(
            vec![AgentRegistration {
                thread_id: "b1".into(),
                port,
                pid: std::process::id(),
                status: AgentStatus::Running,
            }],
            bus.clone(),
        );

        router
            .delegate_task("a0", "b1", "refactor foo", &[], &[])
            .await
            .unwrap();
        assert!(accepted.load(Ordering::Relaxed));

        let delegate = sub.rx.recv().await.unwrap();
        assert_eq!(delegate.topic, "agent.b1.input");
        assert_eq!(delegate.kind, message_type::TASK_DELEGATE);
        assert_eq!(delegate.from, "a0");

        // A subsequent lifecycle event from b1 lands after the delegate in
        // seq order.
        router
            .publish_agent_event(
                "b1",
                RawAgentEvent {
                    method: "turn/started".into(),
                    params: json!({"turnId": "t1"}),
                },
            )
            .await
            .unwrap();
        let lifecycle = sub.rx.recv().await.unwrap();
        assert_eq!(lifecycle.topic, "agent.b1.lifecycle");
        assert!(delegate.seq < lifecycle.seq);
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let bus = Arc::new(MessageBus::new());
        let router = router_with(Vec::new(), bus);
        let err = router
            .delegate_task("a0", "missing", "x", &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn event_kinds_map_to_subtopics() {
        let bus = Arc::new(MessageBus::new());
        let mut sub = bus.subscribe("watcher", "agent.a0");
        let router = router_with(Vec::new(), bus.clone());

        for (method, topic) in [
            ("item/agentMessage/delta", "agent.a0.output"),
            ("item/commandExecution/outputDelta", "agent.a0.exec"),
            ("error", "agent.a0.error"),
            ("turn/completed", "agent.a0.lifecycle"),
            ("rateLimits/updated", "agent.a0.event"),
        ] {
            router
                .publish_agent_event(
                    "a0",
                    RawAgentEvent {
                        method: method.into(),
                        params: json!({}),
                    },
                )
                .await
                .unwrap();
            let msg = sub.rx.recv().await.unwrap();
            assert_eq!(msg.topic, topic, "method {method}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_clients_are_evicted() {
        let bus = Arc::new(MessageBus::new());
        let router = router_with(Vec::new(), bus);
        router.clients.lock().unwrap().insert(
            "dead".into(),
            Arc::new(AgentClient::new(AgentRegistration {
                thread_id: "dead".into(),
                port: 1,
                pid: i32::MAX as u32,
                status: AgentStatus::Running,
            })),
        );
        assert_eq!(router.cleanup_stale(), 1);
        assert!(router.clients.lock().unwrap().is_empty());
    }
}
