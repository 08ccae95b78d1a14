mod bridge;
mod http;
mod rpc;

pub use bridge::{build_envelopes, BridgeEmitter, BridgeEnvelope};
pub use http::router;
pub use rpc::{dispatch, RpcError, RpcRequest};

use cadre_agents::{AgentConfig, AgentLaunchSpec, AgentManager, AgentRouter, StoreDiscoverer};
use cadre_bus::{MessageBus, ResilientPublisher};
use cadre_conversation::ConversationHub;
use cadre_core::{ConfigStore, OrchestrationState, RunRegistry};
use cadre_exec::{CodeRunner, CodeRunnerConfig, CommandCardExecutor};
use cadre_observability::{emit_event, DebugRing, DebugRingConfig, ObservabilityEvent};
use cadre_skills::SkillService;
use cadre_store::Store;
use cadre_types::{now_ms, Notification, RawAgentEvent};
use cadre_workspace::WorkspaceManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cadence for applying batched conversation deltas.
const FLUSH_INTERVAL: Duration = Duration::from_millis(50);
/// Cadence for the stale command-card run sweep.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const STALE_SWEEP_TIMEOUT_SECS: u64 = 240;

pub struct AppStateOptions {
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub workspace_root_dir: PathBuf,
    pub project_root: PathBuf,
    pub user_config_path: PathBuf,
    pub workspace_config_path: Option<PathBuf>,
    pub agent_launch: Option<AgentLaunchSpec>,
}

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<MessageBus>,
    pub publisher: Arc<ResilientPublisher>,
    pub store: Arc<Store>,
    pub conversations: Arc<ConversationHub>,
    pub manager: Arc<AgentManager>,
    pub agent_router: Arc<AgentRouter>,
    pub cards: Arc<CommandCardExecutor>,
    pub runner: Arc<CodeRunner>,
    pub workspaces: Arc<WorkspaceManager>,
    pub config: Arc<ConfigStore>,
    pub skills: Arc<SkillService>,
    pub orchestration: Arc<OrchestrationState>,
    pub runs: RunRegistry,
    pub debug_ring: Arc<DebugRing>,
    pub bridge: Arc<BridgeEmitter>,
    pub shutdown: CancellationToken,
    pub started_at_ms: u64,
    pub agent_launch: Option<AgentLaunchSpec>,
    pub durable_store: bool,
}

impl AppState {
    pub async fn build(options: AppStateOptions) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();

        // A failed durable open degrades to an in-memory store rather than
        // taking the orchestration core down with it.
        let (store, durable_store) = match Store::open(&options.db_path).await {
            Ok(store) => (Arc::new(store), true),
            Err(err) => {
                tracing::warn!(
                    db_path = %options.db_path.display(),
                    error = %err,
                    "durable store unavailable, falling back to in-memory store"
                );
                (Arc::new(Store::open_in_memory().await?), false)
            }
        };

        let bus = Arc::new(MessageBus::new());
        let publisher = Arc::new(ResilientPublisher::new(
            bus.clone(),
            Arc::new(store.pending_store()),
        ));
        let conversations = Arc::new(ConversationHub::new());
        let manager = Arc::new(AgentManager::new(
            store.clone(),
            AgentConfig::default(),
            shutdown.clone(),
        ));
        let agent_router = Arc::new(AgentRouter::new(
            Arc::new(StoreDiscoverer::new(store.clone())),
            publisher.clone(),
        ));
        let cards = Arc::new(CommandCardExecutor::new(store.clone()));
        let runner = Arc::new(CodeRunner::new(CodeRunnerConfig::new(
            options.project_root.clone(),
        ))?);
        let workspaces = Arc::new(WorkspaceManager::new(
            options.workspace_root_dir.clone(),
            store.clone(),
        ));
        let config = Arc::new(
            ConfigStore::load(
                options.user_config_path.clone(),
                options.workspace_config_path.clone(),
            )
            .await?,
        );
        let skills = Arc::new(SkillService::new(
            Some(options.project_root.clone()),
            vec![options.state_dir.join("skills")],
        ));

        let state = Self {
            bus,
            publisher,
            store,
            conversations,
            manager,
            agent_router,
            cards,
            runner,
            workspaces,
            config,
            skills,
            orchestration: Arc::new(OrchestrationState::new()),
            runs: RunRegistry::new(),
            debug_ring: Arc::new(DebugRing::new(DebugRingConfig::default())),
            bridge: Arc::new(BridgeEmitter::new(2048)),
            shutdown,
            started_at_ms: now_ms(),
            agent_launch: options.agent_launch,
            durable_store,
        };
        state.wire_agent_events();
        Ok(state)
    }

    /// Route every child agent event through one pump: conversation state,
    /// UI bridge, debug ring, and the bus sub-topics. The manager's reader
    /// thread only enqueues, so it is never blocked by consumers.
    fn wire_agent_events(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, RawAgentEvent)>();
        self.manager.set_on_event(Some(Arc::new(move |agent_id, event| {
            let _ = tx.send((agent_id.to_string(), event));
        })));

        let conversations = self.conversations.clone();
        let bridge = self.bridge.clone();
        let debug_ring = self.debug_ring.clone();
        let agent_router = self.agent_router.clone();
        let runs = self.runs.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    received = rx.recv() => received,
                };
                let Some((agent_id, event)) = received else { break };

                let mut params = event.params.clone();
                if params.is_object() && params.get("threadId").is_none() {
                    params["threadId"] = serde_json::Value::String(agent_id.clone());
                }
                let notification = Notification::new(event.method.clone(), params.clone());

                conversations.apply(&agent_id, &notification);
                if event.method == cadre_types::method::TURN_COMPLETED {
                    runs.finish_active(&agent_id).await;
                }
                bridge.emit(&event.method, &params);
                debug_ring.publish(&event.method, params, now_ms());
                if let Err(err) = agent_router.publish_agent_event(&agent_id, event).await {
                    let detail = err.to_string();
                    let mut obs = ObservabilityEvent::new("agent.event.publish_failed", "event_pump");
                    obs.agent_id = Some(&agent_id);
                    obs.detail = Some(&detail);
                    emit_event(tracing::Level::WARN, obs);
                }
            }
        });
    }

    /// Spawn the long-running loops: pending-message recovery, the delta
    /// flush tick, stale-run recovery, and one orphan reap at startup.
    pub fn start_background(&self) {
        self.publisher.spawn_recovery_loop(self.shutdown.clone());

        let conversations = self.conversations.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => conversations.flush_all(),
                }
            }
        });

        let cards = self.cards.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match cards.recover_stale_runs(STALE_SWEEP_TIMEOUT_SECS).await {
                    Ok(recovered) if !recovered.is_empty() => {
                        let detail = format!("{} runs recovered", recovered.len());
                        let mut obs =
                            ObservabilityEvent::new("command.run.timeout_recovery", "stale_sweep");
                        obs.detail = Some(&detail);
                        emit_event(tracing::Level::WARN, obs);
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "stale run sweep failed"),
                }
            }
        });

        let manager = self.manager.clone();
        tokio::spawn(async move {
            match manager.clean_orphaned_processes().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(reaped = n, "cleaned orphaned agent registrations"),
                Err(err) => tracing::warn!(error = %err, "orphan cleanup failed"),
            }
        });
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    state.start_background();
    let shutdown = state.shutdown.clone();
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "cadre engine listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
