use crate::AppState;
use cadre_agents::AgentError;
use cadre_exec::{ExecError, RunOneOptions};
use cadre_store::{StoreError, ThreadMessageRecord, ThreadRecord};
use cadre_types::{
    ApprovalDecision, ResumeState, ReviewDecision, RunRequest, WorkspaceCreateRequest,
    WorkspaceMergeRequest,
};
use cadre_workspace::WorkspaceError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;
pub const POLICY_ERROR: i64 = -32001;
pub const TIMEOUT_ERROR: i64 = -32002;
pub const NOT_FOUND: i64 = -32004;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => RpcError::new(NOT_FOUND, err.to_string()),
            StoreError::InvalidValue(_) => RpcError::new(INVALID_PARAMS, err.to_string()),
            _ => RpcError::new(SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<ExecError> for RpcError {
    fn from(err: ExecError) -> Self {
        match &err {
            ExecError::Validation(_) => RpcError::new(INVALID_PARAMS, err.to_string()),
            ExecError::Policy(_) => RpcError::new(POLICY_ERROR, err.to_string()),
            ExecError::NotFound(_) => RpcError::new(NOT_FOUND, err.to_string()),
            _ => RpcError::new(SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<WorkspaceError> for RpcError {
    fn from(err: WorkspaceError) -> Self {
        match &err {
            WorkspaceError::Validation(_) => RpcError::new(INVALID_PARAMS, err.to_string()),
            WorkspaceError::Policy { .. } => RpcError::new(POLICY_ERROR, err.to_string()),
            WorkspaceError::Store(StoreError::NotFound(_)) => {
                RpcError::new(NOT_FOUND, err.to_string())
            }
            _ => RpcError::new(SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<AgentError> for RpcError {
    fn from(err: AgentError) -> Self {
        match &err {
            AgentError::NotFound(_) => RpcError::new(NOT_FOUND, err.to_string()),
            AgentError::Timeout(_) => RpcError::new(TIMEOUT_ERROR, err.to_string()),
            _ => RpcError::new(SERVER_ERROR, err.to_string()),
        }
    }
}

fn str_param<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| params.get(*key).and_then(|v| v.as_str()))
        .filter(|s| !s.trim().is_empty())
}

fn require_str<'a>(params: &'a Value, keys: &[&str]) -> Result<&'a str, RpcError> {
    str_param(params, keys)
        .ok_or_else(|| RpcError::invalid_params(format!("missing required param {}", keys[0])))
}

fn string_list(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(SERVER_ERROR, e.to_string()))
}

pub async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "thread/start" => thread_start(state, params).await,
        "thread/resume" => thread_resume(state, params).await,
        "thread/generateTitle" => thread_generate_title(state, params).await,
        "thread/list" => thread_list(state).await,
        "thread/messages" => thread_messages(state, params).await,
        "turn/start" => turn_start(state, params).await,
        "approval/respond" => approval_respond(state, params).await,
        "config/read" => config_read(state, params).await,
        "config/write" => config_write(state, params).await,
        "workspace/run/list" => workspace_run_list(state).await,
        "workspace/create" => workspace_create(state, params).await,
        "workspace/merge" => workspace_merge(state, params).await,
        "command/prepare" => command_prepare(state, params).await,
        "command/review" => command_review(state, params).await,
        "command/execute" => command_execute(state, params).await,
        "command/runOne" => command_run_one(state, params).await,
        "code/run" => code_run(state, params).await,
        "agent/list" => agent_list(state).await,
        "agent/logs" => agent_logs(state, params).await,
        "agent/stop" => agent_stop(state, params).await,
        "agent/delegate" => agent_delegate(state, params).await,
        "agent/broadcast" => agent_broadcast(state, params).await,
        "skills/list" => skills_list(state).await,
        "orchestration/state" => Ok(to_value(state.orchestration.snapshot())?),
        "mcp-request-from-renderer" => mcp_forward(state, params, "mcp/request").await,
        "mcp-notification-from-renderer" => mcp_forward(state, params, "mcp/notification").await,
        "mcp-response" => mcp_forward(state, params, "mcp/response").await,
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("unknown method {other}"),
        )),
    }
}

async fn thread_start(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let cwd = str_param(&params, &["cwd"]).map(str::to_string);
    let title = str_param(&params, &["title"]).unwrap_or("New thread");
    let thread_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    state
        .store
        .insert_thread(&ThreadRecord {
            id: thread_id.clone(),
            title: title.to_string(),
            cwd: cwd.clone().unwrap_or_default(),
            model: str_param(&params, &["model"]).map(str::to_string),
            archived: false,
            created_at: now,
            updated_at: now,
        })
        .await?;
    let conversation = state.conversations.create(&thread_id, cwd.clone());

    let agent = spawn_agent_if_configured(state, &thread_id, cwd).await;
    Ok(json!({
        "threadId": thread_id,
        "conversation": to_value(conversation)?,
        "agent": agent,
    }))
}

async fn spawn_agent_if_configured(
    state: &AppState,
    thread_id: &str,
    cwd: Option<String>,
) -> Value {
    let Some(launch) = &state.agent_launch else {
        return Value::Null;
    };
    let mut spec = launch.clone();
    if let Some(cwd) = cwd {
        spec.cwd = Some(cwd.into());
    }
    match state.manager.spawn(thread_id, &spec).await {
        Ok(registration) => serde_json::to_value(registration).unwrap_or(Value::Null),
        Err(err) => {
            tracing::warn!(thread_id, error = %err, "agent spawn failed, thread continues detached");
            Value::Null
        }
    }
}

async fn thread_resume(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let thread_id = require_str(&params, &["threadId"])?;
    let thread = state.store.get_thread(thread_id).await?;
    state.conversations.create(
        thread_id,
        (!thread.cwd.is_empty()).then(|| thread.cwd.clone()),
    );
    state
        .conversations
        .set_resume_state(thread_id, ResumeState::Resuming);

    let running = state
        .manager
        .list()
        .await?
        .iter()
        .any(|r| r.thread_id == thread_id);
    let agent = if running {
        Value::Null
    } else {
        spawn_agent_if_configured(state, thread_id, (!thread.cwd.is_empty()).then(|| thread.cwd.clone()))
            .await
    };
    state
        .conversations
        .set_resume_state(thread_id, ResumeState::Resumed);

    Ok(json!({
        "thread": to_value(thread)?,
        "conversation": to_value(state.conversations.snapshot(thread_id))?,
        "agent": agent,
    }))
}

async fn thread_generate_title(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let thread_id = require_str(&params, &["threadId"])?;
    let messages = state.store.list_thread_messages(thread_id).await?;
    let title = messages
        .iter()
        .find(|m| m.role == "user")
        .map(|m| truncate_chars(m.content.trim(), 60))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New thread".to_string());
    state.store.set_thread_title(thread_id, &title).await?;
    Ok(json!({ "title": title }))
}

fn truncate_chars(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max {
        return first_line.to_string();
    }
    first_line.chars().take(max).collect()
}

async fn thread_list(state: &AppState) -> Result<Value, RpcError> {
    let threads = state.store.list_threads().await?;
    let mut out = Vec::with_capacity(threads.len());
    for thread in threads {
        let conversation = state.conversations.snapshot(&thread.id);
        out.push(json!({
            "thread": to_value(thread)?,
            "conversation": to_value(conversation)?,
        }));
    }
    Ok(Value::Array(out))
}

async fn thread_messages(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let thread_id = require_str(&params, &["threadId"])?;
    let messages = state.store.list_thread_messages(thread_id).await?;
    Ok(json!({
        "messages": to_value(messages)?,
        "conversation": to_value(state.conversations.snapshot(thread_id))?,
    }))
}

async fn turn_start(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let thread_id = require_str(&params, &["threadId"])?;
    let prompt = require_str(&params, &["prompt"])?;
    let images = string_list(&params, "images");
    let files = string_list(&params, "files");

    let run_id = Uuid::new_v4().to_string();
    let run = match state
        .runs
        .acquire(thread_id, run_id, Some(thread_id.to_string()))
        .await
    {
        Ok(run) => run,
        Err(existing) => {
            return Ok(json!({
                "accepted": false,
                "activeRun": to_value(existing)?,
            }))
        }
    };

    state.conversations.begin_local_turn(thread_id, prompt);
    state
        .store
        .append_thread_message(&ThreadMessageRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            role: "user".to_string(),
            content: prompt.to_string(),
            created_at: Utc::now(),
        })
        .await?;
    let _ = state.store.touch_thread(thread_id).await;

    let submitted = match state.manager.submit(thread_id, prompt, &images, &files).await {
        Ok(()) => Ok(()),
        Err(AgentError::NotFound(_)) => state
            .agent_router
            .send_to_agent(thread_id, prompt)
            .await
            .map(|_| ()),
        Err(other) => Err(other),
    };
    if let Err(err) = submitted {
        state.runs.finish_active(thread_id).await;
        return Err(err.into());
    }

    Ok(json!({ "accepted": true, "runId": run.run_id }))
}

async fn approval_respond(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let thread_id = require_str(&params, &["threadId"])?;
    let request_id = require_str(&params, &["requestId"])?;
    let decision: ApprovalDecision =
        serde_json::from_value(params.get("decision").cloned().unwrap_or(Value::Null))
            .map_err(|_| {
                RpcError::invalid_params(
                    "decision must be accept | acceptForSession | decline",
                )
            })?;

    let response = state
        .conversations
        .reply_to_request(thread_id, request_id, decision)
        .ok_or_else(|| {
            RpcError::new(NOT_FOUND, format!("no pending request {request_id}"))
        })?;
    if let Err(err) = state
        .manager
        .send_command(thread_id, "approval/response", response.clone())
        .await
    {
        tracing::warn!(thread_id, error = %err, "approval response could not reach agent");
    }
    Ok(json!({ "ok": true, "response": response }))
}

async fn config_read(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let key = str_param(&params, &["key"]);
    let value = state.config.read(key).await;
    Ok(json!({ "key": key, "value": value }))
}

async fn config_write(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let key = require_str(&params, &["key"])?;
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| RpcError::invalid_params("missing required param value"))?;
    let scope = match str_param(&params, &["scope"]) {
        None | Some("user") => cadre_core::ConfigScope::User,
        Some("workspace") => cadre_core::ConfigScope::Workspace,
        Some(other) => {
            return Err(RpcError::invalid_params(format!(
                "scope must be user or workspace, got {other}"
            )))
        }
    };
    state
        .config
        .write(key, value, scope)
        .await
        .map_err(|e| RpcError::new(SERVER_ERROR, e.to_string()))?;
    Ok(json!({ "ok": true }))
}

async fn workspace_run_list(state: &AppState) -> Result<Value, RpcError> {
    let runs = state.workspaces.list_runs().await?;
    Ok(json!({ "runs": to_value(runs)? }))
}

async fn workspace_create(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let req: WorkspaceCreateRequest = serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(e.to_string()))?;
    let run = state.workspaces.create_run(&req).await?;
    Ok(to_value(run)?)
}

async fn workspace_merge(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let req: WorkspaceMergeRequest = serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(e.to_string()))?;
    let report = state.workspaces.merge_run(&req).await?;
    Ok(to_value(report)?)
}

async fn command_prepare(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let card_key = require_str(&params, &["cardKey", "card_key"])?;
    let requested_by = str_param(&params, &["requestedBy", "requested_by"]).unwrap_or("ui");
    let card_params = params.get("params").cloned().unwrap_or_else(|| json!({}));
    let prepared = state
        .cards
        .prepare(card_key, &card_params, requested_by)
        .await?;
    Ok(to_value(prepared)?)
}

async fn command_review(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let run_id = require_str(&params, &["runId", "run_id"])?;
    let reviewer = str_param(&params, &["reviewer"]).unwrap_or("ui");
    let note = str_param(&params, &["note"]).unwrap_or("");
    let decision: ReviewDecision =
        serde_json::from_value(params.get("decision").cloned().unwrap_or(Value::Null))
            .map_err(|_| RpcError::invalid_params("decision must be approved | rejected"))?;
    let run = state.cards.review(run_id, decision, reviewer, note).await?;
    Ok(to_value(run)?)
}

async fn command_execute(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let run_id = require_str(&params, &["runId", "run_id"])?;
    let actor = str_param(&params, &["actor"]).unwrap_or("ui");
    let timeout_secs = params.get("timeoutSecs").and_then(|v| v.as_u64());
    let outcome = state.cards.execute(run_id, actor, timeout_secs).await?;
    Ok(to_value(outcome)?)
}

async fn command_run_one(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let card_key = require_str(&params, &["cardKey", "card_key"])?;
    let requested_by = str_param(&params, &["requestedBy", "requested_by"]).unwrap_or("ui");
    let card_params = params.get("params").cloned().unwrap_or_else(|| json!({}));
    let opts = RunOneOptions {
        auto_approve: params
            .get("autoApprove")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        timeout_secs: params.get("timeoutSecs").and_then(|v| v.as_u64()),
    };
    let outcome = state
        .cards
        .run_one(card_key, &card_params, requested_by, opts)
        .await?;
    Ok(to_value(outcome)?)
}

async fn code_run(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let req: RunRequest = serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(e.to_string()))?;
    let result = state.runner.run(&state.shutdown, req).await?;
    Ok(to_value(result)?)
}

async fn agent_list(state: &AppState) -> Result<Value, RpcError> {
    Ok(json!({ "agents": to_value(state.manager.list().await?)? }))
}

async fn agent_logs(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let agent_id = require_str(&params, &["agentId", "agent_id"])?;
    let last_n = params
        .get("lastN")
        .and_then(|v| v.as_u64())
        .unwrap_or(200) as usize;
    let lines = state.manager.agent_logs(agent_id, last_n).await?;
    Ok(json!({ "lines": to_value(lines)? }))
}

async fn agent_stop(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let agent_id = require_str(&params, &["agentId", "agent_id"])?;
    state.manager.stop(agent_id).await?;
    Ok(json!({ "ok": true }))
}

async fn agent_delegate(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let from_id = require_str(&params, &["fromId", "from_id", "from"])?;
    let to_id = require_str(&params, &["toId", "to_id", "to"])?;
    let prompt = require_str(&params, &["prompt"])?;
    let images = string_list(&params, "images");
    let files = string_list(&params, "files");
    state
        .agent_router
        .delegate_task(from_id, to_id, prompt, &images, &files)
        .await?;
    Ok(json!({ "ok": true }))
}

async fn agent_broadcast(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let from_id = require_str(&params, &["fromId", "from_id", "from"])?;
    let prompt = require_str(&params, &["prompt"])?;
    let delivered = state.agent_router.broadcast(from_id, prompt).await?;
    Ok(json!({ "delivered": delivered }))
}

async fn skills_list(state: &AppState) -> Result<Value, RpcError> {
    let skills = state.skills.list_skills();
    Ok(json!({ "skills": to_value(skills)? }))
}

/// MCP passthrough: the renderer side talks JSON-RPC to us, the agent
/// encapsulates the actual MCP session, we just relay.
async fn mcp_forward(state: &AppState, params: Value, command: &str) -> Result<Value, RpcError> {
    let thread_id = require_str(&params, &["threadId", "thread_id"])?.to_string();
    let payload = params
        .get("payload")
        .or_else(|| params.get("request"))
        .or_else(|| params.get("response"))
        .cloned()
        .unwrap_or(Value::Null);
    let result = state
        .manager
        .send_command(&thread_id, command, payload)
        .await?;
    Ok(result)
}
