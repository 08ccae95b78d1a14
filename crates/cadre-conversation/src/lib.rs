use cadre_types::{
    method, now_ms, ApprovalDecision, ApprovalKind, Conversation, Notification, PendingRequest,
    ResumeState, TokenUsageInfo, Turn, TurnItem, TurnItemDetail, TurnStatus,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;

/// Which accumulated text field a delta appends to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaTarget {
    AgentMessage,
    Plan,
    ReasoningSummary(usize),
    ReasoningContent(usize),
    CommandOutput,
}

#[derive(Debug, Clone)]
struct PendingDelta {
    turn_id: Option<String>,
    item_id: String,
    target: DeltaTarget,
    text: String,
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StreamingChanged {
        conversation_id: String,
        streaming: bool,
    },
    TurnCompleted {
        conversation_id: String,
        turn_id: Option<String>,
    },
    ApprovalRequested {
        conversation_id: String,
        request_id: String,
        kind: ApprovalKind,
        reason: String,
    },
    Updated {
        conversation_id: String,
        method: String,
    },
}

/// Holds per-thread conversation state and applies the normalized event
/// stream to it.
///
/// Every mutation happens under the write lock and observers only ever get
/// clones taken under the read lock, so no observer sees a half-updated
/// turn. Text deltas are buffered and applied in batches; the buffer is
/// always flushed before `turn/completed` becomes observable, so the final
/// text equals the concatenation of all deltas regardless of batching.
pub struct ConversationHub {
    conversations: RwLock<HashMap<String, Conversation>>,
    pending_deltas: Mutex<HashMap<String, Vec<PendingDelta>>>,
    events_tx: broadcast::Sender<ConversationEvent>,
}

impl Default for ConversationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationHub {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            conversations: RwLock::new(HashMap::new()),
            pending_deltas: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events_tx.subscribe()
    }

    pub fn create(&self, id: &str, cwd: Option<String>) -> Conversation {
        let mut conversations = self.conversations.write().unwrap();
        conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id, cwd))
            .clone()
    }

    pub fn set_resume_state(&self, id: &str, state: ResumeState) {
        let mut conversations = self.conversations.write().unwrap();
        if let Some(conversation) = conversations.get_mut(id) {
            conversation.resume_state = state;
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Conversation> {
        self.conversations.read().unwrap().values().cloned().collect()
    }

    pub fn mark_read(&self, id: &str) {
        let mut conversations = self.conversations.write().unwrap();
        if let Some(conversation) = conversations.get_mut(id) {
            conversation.has_unread_turn = false;
        }
    }

    /// Optimistic local turn insert for `turn/start`. The turn id stays
    /// unknown until the agent's `turn/started` arrives and is reconciled
    /// onto this turn.
    pub fn begin_local_turn(&self, conversation_id: &str, prompt: &str) {
        let mut conversations = self.conversations.write().unwrap();
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(conversation_id, None));
        if conversation.in_progress_turn().is_some() {
            return;
        }
        let mut turn = Turn::new(None, now_ms());
        turn.items.push(TurnItem {
            id: format!("user-{}", uuid::Uuid::new_v4()),
            detail: TurnItemDetail::UserMessage {
                text: prompt.to_string(),
            },
        });
        conversation.turns.push(turn);
        drop(conversations);
        self.set_streaming(conversation_id, true);
    }

    /// Apply one normalized notification. Delta methods are buffered; call
    /// [`flush`] on the animation tick. `turn/completed` flushes implicitly
    /// before listeners are notified.
    pub fn apply(&self, conversation_id: &str, notification: &Notification) {
        match notification.method.as_str() {
            method::AGENT_MESSAGE_DELTA => {
                self.buffer_delta(conversation_id, notification, DeltaTarget::AgentMessage)
            }
            method::REASONING_SUMMARY_DELTA => {
                let index = index_param(&notification.params, "summaryIndex");
                self.buffer_delta(
                    conversation_id,
                    notification,
                    DeltaTarget::ReasoningSummary(index),
                )
            }
            method::REASONING_CONTENT_DELTA => {
                let index = index_param(&notification.params, "contentIndex");
                self.buffer_delta(
                    conversation_id,
                    notification,
                    DeltaTarget::ReasoningContent(index),
                )
            }
            method::COMMAND_OUTPUT_DELTA => {
                self.buffer_delta(conversation_id, notification, DeltaTarget::CommandOutput)
            }
            _ => self.apply_now(conversation_id, notification),
        }
    }

    fn buffer_delta(
        &self,
        conversation_id: &str,
        notification: &Notification,
        target: DeltaTarget,
    ) {
        let Some(item_id) = notification.item_id() else {
            return;
        };
        let text = notification
            .params
            .get("delta")
            .or_else(|| notification.params.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut pending = self.pending_deltas.lock().unwrap();
        pending
            .entry(conversation_id.to_string())
            .or_default()
            .push(PendingDelta {
                turn_id: notification.turn_id().map(str::to_string),
                item_id: item_id.to_string(),
                target,
                text,
            });
    }

    /// Drain buffered deltas and apply them in arrival order. Deltas whose
    /// turn is already terminal are no-ops.
    pub fn flush(&self, conversation_id: &str) {
        let batch = {
            let mut pending = self.pending_deltas.lock().unwrap();
            pending.remove(conversation_id).unwrap_or_default()
        };
        if batch.is_empty() {
            return;
        }
        let mut conversations = self.conversations.write().unwrap();
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return;
        };
        for delta in batch {
            let Some(turn) = reconcile_turn_mut(conversation, delta.turn_id.as_deref()) else {
                continue;
            };
            if turn.status.is_terminal() {
                continue;
            }
            apply_delta(turn, &delta.item_id, &delta.target, &delta.text);
        }
    }

    pub fn flush_all(&self) {
        let ids: Vec<String> = {
            let pending = self.pending_deltas.lock().unwrap();
            pending.keys().cloned().collect()
        };
        for id in ids {
            self.flush(&id);
        }
    }

    fn apply_now(&self, conversation_id: &str, notification: &Notification) {
        let mut emitted: Vec<ConversationEvent> = Vec::new();
        match notification.method.as_str() {
            method::THREAD_STARTED => {
                {
                    let mut conversations = self.conversations.write().unwrap();
                    let conversation = conversations
                        .entry(conversation_id.to_string())
                        .or_insert_with(|| Conversation::new(conversation_id, None));
                    conversation.resume_state = ResumeState::Resumed;
                    if let Some(cwd) = notification.params.get("cwd").and_then(|v| v.as_str()) {
                        conversation.cwd = Some(cwd.to_string());
                    }
                    if let Some(model) = notification.params.get("model").and_then(|v| v.as_str())
                    {
                        conversation.latest_model = Some(model.to_string());
                    }
                    if let Some(mode) = notification
                        .params
                        .get("collaborationMode")
                        .and_then(|v| v.as_str())
                    {
                        conversation.latest_collaboration_mode = Some(mode.to_string());
                    }
                }
                self.set_streaming(conversation_id, true);
            }
            method::TURN_STARTED => {
                {
                    let mut conversations = self.conversations.write().unwrap();
                    let conversation = conversations
                        .entry(conversation_id.to_string())
                        .or_insert_with(|| Conversation::new(conversation_id, None));
                    let turn_id = notification.turn_id().map(str::to_string);
                    let open = conversation
                        .turns
                        .iter()
                        .rposition(|t| t.status == TurnStatus::InProgress);
                    match open {
                        Some(index) => {
                            // Reconcile the optimistic local turn with the
                            // server-assigned id.
                            let turn = &mut conversation.turns[index];
                            if turn.turn_id.is_none() {
                                turn.turn_id = turn_id;
                            }
                        }
                        None => {
                            conversation.turns.push(Turn::new(turn_id, now_ms()));
                        }
                    }
                }
                self.set_streaming(conversation_id, true);
            }
            method::ITEM_STARTED | method::ITEM_COMPLETED => {
                self.upsert_item(conversation_id, notification);
                if notification.method == method::ITEM_STARTED {
                    self.set_streaming(conversation_id, true);
                }
            }
            method::TURN_PLAN_UPDATED => {
                self.flush(conversation_id);
                let mut conversations = self.conversations.write().unwrap();
                if let Some(conversation) = conversations.get_mut(conversation_id) {
                    let turn_id = notification.turn_id().map(str::to_string);
                    if let Some(turn) = reconcile_turn_mut(conversation, turn_id.as_deref()) {
                        if !turn.status.is_terminal() {
                            let text = notification
                                .params
                                .get("text")
                                .or_else(|| notification.params.get("plan"))
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            upsert_plan_text(turn, text);
                        }
                    }
                }
            }
            method::TURN_DIFF_UPDATED => {
                let mut conversations = self.conversations.write().unwrap();
                if let Some(conversation) = conversations.get_mut(conversation_id) {
                    let turn_id = notification.turn_id().map(str::to_string);
                    if let Some(turn) = reconcile_turn_mut(conversation, turn_id.as_deref()) {
                        turn.diff = notification
                            .params
                            .get("diff")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                    }
                }
            }
            method::TOKEN_USAGE_UPDATED => {
                let mut conversations = self.conversations.write().unwrap();
                if let Some(conversation) = conversations.get_mut(conversation_id) {
                    if let Ok(usage) = serde_json::from_value::<TokenUsageInfo>(
                        notification
                            .params
                            .get("tokenUsage")
                            .cloned()
                            .unwrap_or_else(|| notification.params.clone()),
                    ) {
                        conversation.latest_token_usage_info = Some(usage);
                    }
                }
            }
            method::TURN_COMPLETED | method::TURN_CANCELLED => {
                // The delta batch must be observable before the terminal
                // state is.
                self.flush(conversation_id);
                let completed_turn_id = {
                    let mut conversations = self.conversations.write().unwrap();
                    conversations.get_mut(conversation_id).and_then(|conversation| {
                        let turn_id = notification.turn_id().map(str::to_string);
                        let turn = reconcile_turn_mut(conversation, turn_id.as_deref())?;
                        if turn.status.is_terminal() {
                            return None;
                        }
                        turn.status = if notification.method == method::TURN_COMPLETED {
                            TurnStatus::Completed
                        } else {
                            TurnStatus::Cancelled
                        };
                        let id = turn.turn_id.clone();
                        conversation.has_unread_turn = true;
                        Some(id)
                    })
                };
                self.set_streaming(conversation_id, false);
                if notification.method == method::TURN_COMPLETED {
                    if let Some(turn_id) = completed_turn_id {
                        emitted.push(ConversationEvent::TurnCompleted {
                            conversation_id: conversation_id.to_string(),
                            turn_id,
                        });
                    }
                }
            }
            method::ERROR => {
                self.flush(conversation_id);
                {
                    let mut conversations = self.conversations.write().unwrap();
                    if let Some(conversation) = conversations.get_mut(conversation_id) {
                        let message = notification
                            .params
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("agent error")
                            .to_string();
                        let turn_id = notification.turn_id().map(str::to_string);
                        if let Some(turn) = reconcile_turn_mut(conversation, turn_id.as_deref()) {
                            if !turn.status.is_terminal() {
                                turn.status = TurnStatus::Error;
                                turn.error = Some(message);
                            }
                        }
                    }
                }
                self.set_streaming(conversation_id, false);
            }
            method::COMMAND_REQUEST_APPROVAL
            | method::FILE_CHANGE_REQUEST_APPROVAL
            | method::TOOL_REQUEST_USER_INPUT => {
                let kind = match notification.method.as_str() {
                    method::COMMAND_REQUEST_APPROVAL => ApprovalKind::CommandExecution,
                    method::FILE_CHANGE_REQUEST_APPROVAL => ApprovalKind::FileChange,
                    _ => ApprovalKind::ToolInput,
                };
                let request_id = notification
                    .params
                    .get("requestId")
                    .and_then(|v| v.as_str())
                    .or_else(|| notification.item_id())
                    .unwrap_or_default()
                    .to_string();
                if request_id.is_empty() {
                    return;
                }
                let reason = notification
                    .params
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                {
                    let mut conversations = self.conversations.write().unwrap();
                    let conversation = conversations
                        .entry(conversation_id.to_string())
                        .or_insert_with(|| Conversation::new(conversation_id, None));
                    if !conversation.requests.iter().any(|r| r.id == request_id) {
                        conversation.requests.push(PendingRequest {
                            id: request_id.clone(),
                            kind,
                            reason: reason.clone(),
                            item_id: notification.item_id().map(str::to_string),
                        });
                    }
                }
                emitted.push(ConversationEvent::ApprovalRequested {
                    conversation_id: conversation_id.to_string(),
                    request_id,
                    kind,
                    reason,
                });
            }
            other => {
                tracing::debug!(method = other, "unhandled notification method");
            }
        }

        emitted.push(ConversationEvent::Updated {
            conversation_id: conversation_id.to_string(),
            method: notification.method.clone(),
        });
        for event in emitted {
            let _ = self.events_tx.send(event);
        }
    }

    fn upsert_item(&self, conversation_id: &str, notification: &Notification) {
        let Some(item_value) = notification.params.get("item") else {
            return;
        };
        let Ok(item) = serde_json::from_value::<TurnItem>(item_value.clone()) else {
            tracing::debug!(method = %notification.method, "ignoring undecodable item");
            return;
        };
        let mut conversations = self.conversations.write().unwrap();
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return;
        };
        let turn_id = notification.turn_id().map(str::to_string);
        let Some(turn) = reconcile_turn_mut(conversation, turn_id.as_deref()) else {
            return;
        };
        if turn.status.is_terminal() {
            return;
        }
        if matches!(item.detail, TurnItemDetail::AssistantMessage { .. })
            && turn.final_assistant_started_at_ms.is_none()
        {
            turn.final_assistant_started_at_ms = Some(now_ms());
        }
        match turn.items.iter().position(|i| i.id == item.id) {
            Some(index) => merge_item(&mut turn.items[index], item),
            None => turn.items.push(item),
        }
    }

    fn set_streaming(&self, conversation_id: &str, streaming: bool) {
        let changed = {
            let mut conversations = self.conversations.write().unwrap();
            let conversation = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id, None));
            if conversation.is_streaming == streaming {
                false
            } else {
                conversation.is_streaming = streaming;
                true
            }
        };
        if changed {
            let _ = self.events_tx.send(ConversationEvent::StreamingChanged {
                conversation_id: conversation_id.to_string(),
                streaming,
            });
        }
    }

    /// Build the approval response and drop the pending entry. Returns the
    /// message to dispatch to the agent, or `None` when the request id is
    /// unknown.
    pub fn reply_to_request(
        &self,
        conversation_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Option<Value> {
        let mut conversations = self.conversations.write().unwrap();
        let conversation = conversations.get_mut(conversation_id)?;
        let before = conversation.requests.len();
        conversation.requests.retain(|r| r.id != request_id);
        if conversation.requests.len() == before {
            return None;
        }
        let decision = match decision {
            ApprovalDecision::Accept => "accept",
            ApprovalDecision::AcceptForSession => "acceptForSession",
            ApprovalDecision::Decline => "decline",
        };
        Some(json!({
            "id": request_id,
            "result": { "decision": decision },
        }))
    }
}

/// Find the turn addressed by `turn_id`; fall back to the latest turn when
/// the id is unknown (covers the race between the optimistic local insert
/// and the server's `turn/started`).
fn reconcile_turn_mut<'a>(
    conversation: &'a mut Conversation,
    turn_id: Option<&str>,
) -> Option<&'a mut Turn> {
    if let Some(id) = turn_id {
        let position = conversation
            .turns
            .iter()
            .rposition(|t| t.turn_id.as_deref() == Some(id));
        if let Some(index) = position {
            return conversation.turns.get_mut(index);
        }
    }
    conversation.turns.last_mut()
}

/// Shallow-merge a re-sent item into the stored one, preserving accumulated
/// delta text when the update carries none.
fn merge_item(existing: &mut TurnItem, incoming: TurnItem) {
    match (&mut existing.detail, incoming.detail) {
        (
            TurnItemDetail::AssistantMessage { text },
            TurnItemDetail::AssistantMessage { text: new_text },
        ) => {
            if !new_text.is_empty() {
                *text = new_text;
            }
        }
        (
            TurnItemDetail::TerminalCommand {
                command,
                cwd,
                exit_code,
                aggregated_output,
            },
            TurnItemDetail::TerminalCommand {
                command: new_command,
                cwd: new_cwd,
                exit_code: new_exit,
                aggregated_output: new_output,
            },
        ) => {
            if !new_command.is_empty() {
                *command = new_command;
            }
            if new_cwd.is_some() {
                *cwd = new_cwd;
            }
            if new_exit.is_some() {
                *exit_code = new_exit;
            }
            if !new_output.is_empty() {
                *aggregated_output = new_output;
            }
        }
        (
            TurnItemDetail::Reasoning { summary, content },
            TurnItemDetail::Reasoning {
                summary: new_summary,
                content: new_content,
            },
        ) => {
            if !new_summary.is_empty() {
                *summary = new_summary;
            }
            if !new_content.is_empty() {
                *content = new_content;
            }
        }
        (TurnItemDetail::Plan { text }, TurnItemDetail::Plan { text: new_text }) => {
            if !new_text.is_empty() {
                *text = new_text;
            }
        }
        (slot, incoming_detail) => *slot = incoming_detail,
    }
}

fn apply_delta(turn: &mut Turn, item_id: &str, target: &DeltaTarget, text: &str) {
    let index = match turn.items.iter().position(|i| i.id == item_id) {
        Some(index) => index,
        None => {
            let detail = match target {
                DeltaTarget::AgentMessage => TurnItemDetail::AssistantMessage {
                    text: String::new(),
                },
                DeltaTarget::Plan => TurnItemDetail::Plan {
                    text: String::new(),
                },
                DeltaTarget::ReasoningSummary(_) | DeltaTarget::ReasoningContent(_) => {
                    TurnItemDetail::Reasoning {
                        summary: Vec::new(),
                        content: Vec::new(),
                    }
                }
                DeltaTarget::CommandOutput => TurnItemDetail::TerminalCommand {
                    command: String::new(),
                    cwd: None,
                    exit_code: None,
                    aggregated_output: String::new(),
                },
            };
            if matches!(target, DeltaTarget::AgentMessage)
                && turn.final_assistant_started_at_ms.is_none()
            {
                turn.final_assistant_started_at_ms = Some(now_ms());
            }
            turn.items.push(TurnItem {
                id: item_id.to_string(),
                detail,
            });
            turn.items.len() - 1
        }
    };
    let item = &mut turn.items[index];

    match (&mut item.detail, target) {
        (TurnItemDetail::AssistantMessage { text: slot }, DeltaTarget::AgentMessage) => {
            slot.push_str(text)
        }
        (TurnItemDetail::Plan { text: slot }, DeltaTarget::Plan) => slot.push_str(text),
        (TurnItemDetail::Reasoning { summary, .. }, DeltaTarget::ReasoningSummary(index)) => {
            while summary.len() <= *index {
                summary.push(String::new());
            }
            summary[*index].push_str(text);
        }
        (TurnItemDetail::Reasoning { content, .. }, DeltaTarget::ReasoningContent(index)) => {
            while content.len() <= *index {
                content.push(String::new());
            }
            content[*index].push_str(text);
        }
        (
            TurnItemDetail::TerminalCommand {
                aggregated_output, ..
            },
            DeltaTarget::CommandOutput,
        ) => aggregated_output.push_str(text),
        (TurnItemDetail::TerminalOutput { text: slot }, DeltaTarget::CommandOutput) => {
            slot.push_str(text)
        }
        _ => {}
    }
}

fn upsert_plan_text(turn: &mut Turn, text: String) {
    for item in turn.items.iter_mut() {
        if let TurnItemDetail::Plan { text: slot } = &mut item.detail {
            *slot = text;
            return;
        }
    }
    turn.items.push(TurnItem {
        id: format!("plan-{}", uuid::Uuid::new_v4()),
        detail: TurnItemDetail::Plan { text },
    });
}

fn index_param(params: &Value, key: &str) -> usize {
    params
        .get(key)
        .or_else(|| params.get("index"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize
}
