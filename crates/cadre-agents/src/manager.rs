use crate::{parse_sse_event, pid_alive, AgentError, AgentResult};
use crate::{AgentLogBuffer, AgentLogLine, LogStream};
use cadre_store::Store;
use cadre_types::{AgentRegistration, AgentStatus, RawAgentEvent};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const STOP_GRACE: Duration = Duration::from_secs(3);
const STOP_ALL_BUDGET: Duration = Duration::from_secs(2);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const LOG_RING_LINES: usize = 2000;

/// Environment variables forwarded from the engine to every child agent.
const FORWARDED_ENV: &[&str] = &["LLM_MODEL", "OPENAI_API_KEY", "LOG_LEVEL"];

pub type EventSink = Arc<dyn Fn(&str, RawAgentEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AgentLaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ready_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ready_timeout: READY_TIMEOUT,
        }
    }
}

struct AgentHandle {
    thread_id: String,
    port: u16,
    pid: u32,
    child: Mutex<Option<tokio::process::Child>>,
    logs: Arc<AgentLogBuffer>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    reader_stop: CancellationToken,
}

impl AgentHandle {
    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Owns child agent processes: spawn, readiness, stdio draining, the event
/// reader feeding the single installed sink, and bounded-shutdown stop.
pub struct AgentManager {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    store: Arc<Store>,
    config: AgentConfig,
    on_event: StdRwLock<Option<EventSink>>,
    http: reqwest::Client,
    stream_http: reqwest::Client,
    shutdown: CancellationToken,
}

impl AgentManager {
    pub fn new(store: Arc<Store>, config: AgentConfig, shutdown: CancellationToken) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client");
        // SSE needs no global timeout; keepalive covers dead peers.
        let stream_http = reqwest::Client::builder()
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("failed to build stream client");
        Self {
            agents: RwLock::new(HashMap::new()),
            store,
            config,
            on_event: StdRwLock::new(None),
            http,
            stream_http,
            shutdown,
        }
    }

    /// Install the single sink every child's event stream feeds into. The
    /// handler runs on the reader task and must not block it indefinitely.
    pub fn set_on_event(&self, sink: Option<EventSink>) {
        *self.on_event.write().unwrap() = sink;
    }

    pub async fn spawn(
        &self,
        thread_id: &str,
        spec: &AgentLaunchSpec,
    ) -> AgentResult<AgentRegistration> {
        {
            let agents = self.agents.read().await;
            if agents.contains_key(thread_id) {
                return Err(AgentError::Spawn(format!(
                    "agent {thread_id} is already running"
                )));
            }
        }

        let port = find_available_port()?;
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .arg("--port")
            .arg(port.to_string())
            .arg("--thread-id")
            .arg(thread_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for key in FORWARDED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {e}", spec.program)))?;
        let pid = child
            .id()
            .ok_or_else(|| AgentError::Spawn("child exited before registration".into()))?;

        // stdio must always be drained; a full pipe deadlocks the child.
        let logs = Arc::new(AgentLogBuffer::with_capacity(LOG_RING_LINES));
        if let Some(stdout) = child.stdout.take() {
            spawn_line_drain(stdout, logs.clone(), LogStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_drain(stderr, logs.clone(), LogStream::Stderr);
        }

        let handle = Arc::new(AgentHandle {
            thread_id: thread_id.to_string(),
            port,
            pid,
            child: Mutex::new(Some(child)),
            logs,
            reader: Mutex::new(None),
            reader_stop: self.shutdown.child_token(),
        });

        if let Err(err) = self.wait_for_ready(&handle).await {
            self.kill_handle(&handle).await;
            return Err(err);
        }

        let registration = AgentRegistration {
            thread_id: thread_id.to_string(),
            port,
            pid,
            status: AgentStatus::Running,
        };
        self.store.upsert_agent(&registration).await?;

        let reader = self.spawn_reader(handle.clone());
        *handle.reader.lock().await = Some(reader);
        self.agents
            .write()
            .await
            .insert(thread_id.to_string(), handle);

        tracing::info!(thread_id, port, pid, "agent started");
        Ok(registration)
    }

    async fn wait_for_ready(&self, handle: &AgentHandle) -> AgentResult<()> {
        let url = format!("{}/health", handle.base_url());
        let start = Instant::now();
        let mut last_error = String::new();
        while start.elapsed() < self.config.ready_timeout {
            match self
                .http
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_error = format!("health status {}", resp.status()),
                Err(err) => last_error = err.to_string(),
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(AgentError::Timeout(format!(
            "agent {} not ready within {:?}: {last_error}",
            handle.thread_id, self.config.ready_timeout
        )))
    }

    fn spawn_reader(&self, handle: Arc<AgentHandle>) -> tokio::task::JoinHandle<()> {
        let client = self.stream_http.clone();
        let sink = self.sink();
        let stop = handle.reader_stop.clone();
        tokio::spawn(async move {
            let url = format!("{}/events", handle.base_url());
            loop {
                if stop.is_cancelled() {
                    break;
                }
                let response = client
                    .get(&url)
                    .header("Accept", "text/event-stream")
                    .send()
                    .await;
                let response = match response {
                    Ok(resp) if resp.status().is_success() => resp,
                    Ok(resp) => {
                        tracing::warn!(
                            thread_id = %handle.thread_id,
                            status = %resp.status(),
                            "event stream subscription failed"
                        );
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(thread_id = %handle.thread_id, error = %err, "event stream connect failed");
                        break;
                    }
                };

                let mut stream = response.bytes_stream();
                let mut buffer = String::new();
                loop {
                    let chunk = tokio::select! {
                        _ = stop.cancelled() => None,
                        chunk = stream.next() => chunk,
                    };
                    let Some(chunk) = chunk else { break };
                    let Ok(bytes) = chunk else { break };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(event) = parse_sse_event(&mut buffer) {
                        if let Some(sink) = sink.as_ref() {
                            sink(&handle.thread_id, event);
                        }
                    }
                }
                if stop.is_cancelled() {
                    break;
                }
                // Stream ended; brief backoff then resubscribe while the
                // process is still alive.
                if !pid_alive(handle.pid) {
                    tracing::info!(thread_id = %handle.thread_id, "agent process exited, stopping reader");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
    }

    fn sink(&self) -> Option<EventSink> {
        self.on_event.read().unwrap().clone()
    }

    pub async fn submit(
        &self,
        agent_id: &str,
        prompt: &str,
        images: &[String],
        files: &[String],
    ) -> AgentResult<()> {
        let handle = self.handle(agent_id).await?;
        let url = format!("{}/submit", handle.base_url());
        let body = json!({ "prompt": prompt, "images": images, "files": files });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Transport(format!(
                "submit to {agent_id} failed with status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn send_command(
        &self,
        agent_id: &str,
        command: &str,
        args: Value,
    ) -> AgentResult<Value> {
        let handle = self.handle(agent_id).await?;
        let url = format!("{}/command", handle.base_url());
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "command": command, "args": args }))
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Transport(format!(
                "command {command} to {agent_id} failed with status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    /// Graceful stop with a 3 second deadline, then the process group is
    /// killed. Stopping an unknown agent is an error the caller must treat
    /// as fatal.
    pub async fn stop(&self, agent_id: &str) -> AgentResult<()> {
        let handle = {
            let mut agents = self.agents.write().await;
            agents
                .remove(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?
        };

        handle.reader_stop.cancel();
        let shutdown_url = format!("{}/shutdown", handle.base_url());
        let graceful = self
            .http
            .post(&shutdown_url)
            .timeout(STOP_GRACE)
            .send()
            .await;
        let exited = match graceful {
            Ok(_) => {
                let mut child_guard = handle.child.lock().await;
                if let Some(child) = child_guard.as_mut() {
                    tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok()
                } else {
                    true
                }
            }
            Err(_) => false,
        };
        if !exited {
            self.kill_handle(&handle).await;
        } else {
            *handle.child.lock().await = None;
        }
        if let Some(reader) = handle.reader.lock().await.take() {
            reader.abort();
        }
        self.store.remove_agent(agent_id).await?;
        tracing::info!(agent_id, "agent stopped");
        Ok(())
    }

    /// Concurrent stop of every known agent, bounded by a 2 second
    /// aggregate wait. Agents that miss the window are group-killed.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        let stops = ids.iter().map(|id| self.stop(id.as_str()));
        let all = futures::future::join_all(stops);
        if tokio::time::timeout(STOP_ALL_BUDGET, all).await.is_err() {
            let remaining: Vec<Arc<AgentHandle>> =
                self.agents.write().await.drain().map(|(_, h)| h).collect();
            for handle in remaining {
                self.kill_handle(&handle).await;
                let _ = self.store.remove_agent(&handle.thread_id).await;
            }
        }
    }

    async fn kill_handle(&self, handle: &AgentHandle) {
        #[cfg(unix)]
        unsafe {
            libc::killpg(handle.pid as i32, libc::SIGKILL);
        }
        let mut child_guard = handle.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            let _ = child.kill().await;
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
    }

    async fn handle(&self, agent_id: &str) -> AgentResult<Arc<AgentHandle>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
    }

    pub async fn list(&self) -> AgentResult<Vec<AgentRegistration>> {
        Ok(self.store.list_agents().await?)
    }

    pub async fn agent_logs(&self, agent_id: &str, last_n: usize) -> AgentResult<Vec<AgentLogLine>> {
        let handle = self.handle(agent_id).await?;
        Ok(handle.logs.tail(last_n))
    }

    /// Run once at startup: drop discovery rows whose recorded PID no
    /// longer exists.
    pub async fn clean_orphaned_processes(&self) -> AgentResult<usize> {
        let rows = self.store.list_agents().await?;
        let mut removed = 0;
        for row in rows {
            if !pid_alive(row.pid) {
                self.store.remove_agent(&row.thread_id).await?;
                removed += 1;
                tracing::info!(
                    thread_id = %row.thread_id,
                    pid = row.pid,
                    "reaped orphaned agent registration"
                );
            }
        }
        Ok(removed)
    }
}

fn spawn_line_drain(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    logs: Arc<AgentLogBuffer>,
    log_stream: LogStream,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.record(log_stream, line);
        }
    });
}

fn find_available_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
