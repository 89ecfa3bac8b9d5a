//! The reduction engine: converts batches of normalized, possibly-duplicated,
//! possibly out-of-order records into a stable, incrementally-updatable
//! message history.
//!
//! Processing runs as named phases whose order is load-bearing: each phase's
//! writes are visible to the later phases within the same call. Replaying
//! any batch against the same state is a no-op.

use crate::agent_state::{AgentStateSnapshot, CompletedRequest, PermissionStatus};
use crate::reducer::events::parse_message_as_event;
use crate::reducer::message::{
    DisplayMessage, PermissionRecord, ReducerPayload, ToolCallState, ToolState,
};
use crate::reducer::state::{
    AgentTodo, ReducerState, Seen, StoredPermission, TodoSnapshot, UsageSnapshot,
};
use crate::reducer::tracer;
use crate::types::MessageId;
use crate::wire::{
    AgentEvent, AgentItem, NormalizedMessage, PermissionUpdate, RecordContent,
};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};

const CONTEXT_RESET_MESSAGE: &str = "Context was reset";
const COMPACTION_DONE_MESSAGE: &str = "Compaction completed";

/// Result of one `reduce` call. `messages` carries only the display messages
/// newly created or mutated by this call, so callers can patch the UI
/// incrementally. `todos`/`usage` are present when the respective snapshot
/// changed.
#[derive(Debug, Default)]
pub struct ReduceOutput {
    pub messages: Vec<DisplayMessage>,
    pub todos: Option<TodoSnapshot>,
    pub usage: Option<UsageSnapshot>,
    pub has_ready_event: bool,
}

#[derive(Default)]
struct ReduceCtx {
    changed: BTreeSet<MessageId>,
    has_ready_event: bool,
    todos_dirty: bool,
    usage_dirty: bool,
}

/// Run one reduction step. Not reentrant for a given state; callers must
/// serialize calls per conversation (the inbound update stream already
/// does).
pub fn reduce(
    state: &mut ReducerState,
    batch: Vec<NormalizedMessage>,
    agent_state: Option<&AgentStateSnapshot>,
) -> ReduceOutput {
    let traced = tracer::trace(&mut state.tracer, batch);
    let mut main = Vec::new();
    let mut side = Vec::new();
    for t in traced {
        match t.sidechain_id {
            Some(sid) => side.push((t.message, sid)),
            None => main.push(t.message),
        }
    }

    let mut ctx = ReduceCtx::default();

    // Phase 0: agent-state permissions.
    if let Some(snapshot) = agent_state {
        let incoming: HashSet<String> = main
            .iter()
            .flat_map(tool_call_ids)
            .map(str::to_string)
            .collect();
        phase_agent_state(state, &mut ctx, snapshot, &incoming);
    }

    // Phase 0.5: message -> event conversion. Converted messages take no
    // further part in phases 1-5.
    let mut working = Vec::with_capacity(main.len());
    for msg in main {
        if !phase_convert_events(state, &mut ctx, &msg) {
            working.push(msg);
        }
    }

    phase_user_and_text(state, &mut ctx, &working);
    phase_tool_calls(state, &mut ctx, &working);
    phase_tool_results(state, &mut ctx, &working);
    phase_sidechains(state, &mut ctx, side);
    phase_events(state, &mut ctx, &working);

    ReduceOutput {
        messages: ctx
            .changed
            .iter()
            .filter_map(|id| state.display_message(*id))
            .collect(),
        todos: ctx.todos_dirty.then(|| state.latest_todos.clone()),
        usage: ctx.usage_dirty.then_some(state.latest_usage),
        has_ready_event: ctx.has_ready_event,
    }
}

fn tool_call_ids(msg: &NormalizedMessage) -> impl Iterator<Item = &str> {
    let items = match &msg.content {
        RecordContent::Agent { content } => content.as_slice(),
        _ => &[],
    };
    items.iter().filter_map(|item| match item {
        AgentItem::ToolCall { id, .. } => Some(id.as_str()),
        _ => None,
    })
}

/// Phase 0. Pending requests attach (or placeholder-synthesize) a pending
/// permission; completed requests update or synthesize terminal tools,
/// except where tool-result data already took precedence.
fn phase_agent_state(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    snapshot: &AgentStateSnapshot,
    incoming_tool_ids: &HashSet<String>,
) {
    for (id, req) in &snapshot.requests {
        // Completed wins when a request appears in both maps.
        if snapshot.completed_requests.contains_key(id) {
            continue;
        }
        state.index.store_permission(StoredPermission {
            id: id.clone(),
            tool: req.tool.clone(),
            arguments: req.arguments.clone(),
            created_at: req.created_at,
            completed_at: None,
            status: PermissionStatus::Pending,
            reason: None,
            mode: None,
            allowed_tools: None,
            decision: None,
        });
        if let Some(mid) = state.index.tool_message(id, false) {
            if let Some(tool) = state.tool_mut(mid) {
                if tool.permission.is_none() {
                    tool.permission = Some(PermissionRecord::pending(id.clone()));
                    ctx.changed.insert(mid);
                }
            }
        } else {
            let mut tool =
                ToolCallState::running(req.tool.clone(), req.arguments.clone(), req.created_at);
            tool.permission = Some(PermissionRecord::pending(id.clone()));
            let mid =
                state.insert_message(None, req.created_at, ReducerPayload::Tool(tool), None);
            state.index.register_tool(id, mid, false);
            ctx.changed.insert(mid);
        }
    }

    for (id, req) in &snapshot.completed_requests {
        state.index.store_permission(StoredPermission {
            id: id.clone(),
            tool: req.tool.clone(),
            arguments: req.arguments.clone(),
            created_at: req.created_at,
            completed_at: Some(req.completed_at),
            status: req.status,
            reason: req.reason.clone(),
            mode: req.mode.clone(),
            allowed_tools: req.allowed_tools.clone(),
            decision: req.decision.clone(),
        });
        if let Some(mid) = state.index.tool_message(id, false) {
            apply_completed_request(state, ctx, mid, id, req);
        } else if incoming_tool_ids.contains(id) {
            // Deferred: this batch carries the tool call itself; Phase 2
            // seeds the new message from the stored permission.
        } else {
            synthesize_terminal_tool(state, ctx, id, req);
        }
    }
}

fn apply_completed_request(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    mid: MessageId,
    id: &str,
    req: &CompletedRequest,
) {
    let Some(tool) = state.tool_mut(mid) else {
        return;
    };
    // Precedence: once execution started under an approval, or once a
    // tool-result supplied permission info (date set), agent-state data no
    // longer applies.
    let skip = (tool.started_at.is_some() && req.status == PermissionStatus::Approved)
        || tool.permission.as_ref().is_some_and(|p| p.date.is_some());
    if skip {
        tracing::debug!(permission = id, "skipping agent-state permission update");
        return;
    }
    let perm = tool
        .permission
        .get_or_insert_with(|| PermissionRecord::pending(id.to_string()));
    perm.status = req.status;
    perm.reason = req.reason.clone();
    perm.mode = req.mode.clone();
    perm.allowed_tools = req.allowed_tools.clone();
    if req.decision.is_some() {
        perm.decision = req.decision.clone();
    }
    perm.date = Some(req.completed_at);
    if !tool.state.is_terminal() {
        match req.status {
            PermissionStatus::Approved => tool.state = ToolState::Running,
            PermissionStatus::Denied | PermissionStatus::Canceled => {
                tool.state = ToolState::Error;
                tool.completed_at = Some(req.completed_at);
                if tool.result.is_none() {
                    tool.result = Some(json!({ "error": denial_reason(req) }));
                }
            }
            PermissionStatus::Pending => {}
        }
    }
    ctx.changed.insert(mid);
}

/// A decision arrived for a tool whose call content never did (and isn't in
/// this batch): materialize it as a terminal message directly.
fn synthesize_terminal_tool(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    id: &str,
    req: &CompletedRequest,
) {
    let mut tool = ToolCallState::running(req.tool.clone(), req.arguments.clone(), req.created_at);
    tool.permission = Some(PermissionRecord {
        id: id.to_string(),
        status: req.status,
        reason: req.reason.clone(),
        mode: req.mode.clone(),
        allowed_tools: req.allowed_tools.clone(),
        decision: req.decision.clone(),
        date: Some(req.completed_at),
    });
    tool.completed_at = Some(req.completed_at);
    if req.status == PermissionStatus::Approved {
        tool.state = ToolState::Completed;
    } else {
        tool.state = ToolState::Error;
        tool.result = Some(json!({ "error": denial_reason(req) }));
    }
    let mid = state.insert_message(None, req.created_at, ReducerPayload::Tool(tool), None);
    state.index.register_tool(id, mid, false);
    ctx.changed.insert(mid);
}

fn denial_reason(req: &CompletedRequest) -> String {
    req.reason
        .clone()
        .unwrap_or_else(|| format!("Permission {}", req.status))
}

/// Phase 0.5. Returns true when the message was consumed as an event (or
/// suppressed entirely); consumed messages are still marked processed so
/// replay stays idempotent.
fn phase_convert_events(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    msg: &NormalizedMessage,
) -> bool {
    if state.index.is_record_seen(&msg.id) {
        return false;
    }
    if msg
        .local_id
        .as_deref()
        .is_some_and(|l| state.index.is_local_seen(l))
    {
        return false;
    }
    if let RecordContent::Event { event } = &msg.content {
        match event {
            AgentEvent::Ready => {
                state.index.mark_record(&msg.id, Seen::Consumed);
                ctx.has_ready_event = true;
                return true;
            }
            AgentEvent::Message { message } if message == CONTEXT_RESET_MESSAGE => {
                state.latest_todos = TodoSnapshot {
                    todos: Vec::new(),
                    timestamp: msg.created_at,
                };
                state.latest_usage = UsageSnapshot::zeroed(msg.created_at);
                ctx.todos_dirty = true;
                ctx.usage_dirty = true;
                materialize_event(state, ctx, msg, event.clone());
                return true;
            }
            AgentEvent::Message { message } if message == COMPACTION_DONE_MESSAGE => {
                state.latest_usage = UsageSnapshot::zeroed(msg.created_at);
                ctx.usage_dirty = true;
                materialize_event(state, ctx, msg, event.clone());
                return true;
            }
            // Plain events become messages in Phase 5.
            _ => return false,
        }
    }
    if let Some(event) = parse_message_as_event(msg) {
        materialize_event(state, ctx, msg, event);
        return true;
    }
    false
}

fn materialize_event(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    msg: &NormalizedMessage,
    event: AgentEvent,
) {
    let mid = state.insert_message(
        Some(msg.id.clone()),
        msg.created_at,
        ReducerPayload::Event(event),
        msg.meta.clone(),
    );
    state.index.mark_record(&msg.id, Seen::Message(mid));
    if let Some(local) = &msg.local_id {
        state.index.mark_local(local, mid);
    }
    ctx.changed.insert(mid);
}

/// Phase 1. User messages dedup by local and canonical id; agent text items
/// each become one message; usage snapshots advance most-recent-wins. Tool
/// content is deliberately left for phases 2 and 3.
fn phase_user_and_text(state: &mut ReducerState, ctx: &mut ReduceCtx, working: &[NormalizedMessage]) {
    for msg in working {
        match &msg.content {
            RecordContent::User { content } => {
                let local_seen = msg
                    .local_id
                    .as_deref()
                    .is_some_and(|l| state.index.is_local_seen(l));
                if local_seen || state.index.is_record_seen(&msg.id) {
                    // Record both aliases so the other key can't reprocess it.
                    state.index.mark_record(&msg.id, Seen::Consumed);
                    continue;
                }
                let (text, images) = NormalizedMessage::flatten_user(content);
                let mid = state.insert_message(
                    Some(msg.id.clone()),
                    msg.created_at,
                    ReducerPayload::UserText { text, images },
                    msg.meta.clone(),
                );
                state.index.mark_record(&msg.id, Seen::Message(mid));
                if let Some(local) = &msg.local_id {
                    state.index.mark_local(local, mid);
                }
                ctx.changed.insert(mid);
            }
            RecordContent::Agent { content } => {
                if state.index.is_record_seen(&msg.id) {
                    continue;
                }
                if let Some(usage) = &msg.usage {
                    if msg.created_at > state.latest_usage.timestamp {
                        state.latest_usage = UsageSnapshot {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            cache_creation_input_tokens: usage.cache_creation_input_tokens,
                            cache_read_input_tokens: usage.cache_read_input_tokens,
                            timestamp: msg.created_at,
                        };
                        ctx.usage_dirty = true;
                    }
                }
                let mut created = Vec::new();
                for item in content {
                    if let AgentItem::Text { text } = item {
                        let mid = state.insert_message(
                            Some(msg.id.clone()),
                            msg.created_at,
                            ReducerPayload::AgentText { text: text.clone() },
                            msg.meta.clone(),
                        );
                        ctx.changed.insert(mid);
                        created.push(mid);
                    }
                }
                let seen = match created.as_slice() {
                    [only] => Seen::Message(*only),
                    _ => Seen::Consumed,
                };
                state.index.mark_record(&msg.id, seen);
            }
            RecordContent::Event { .. } => {}
        }
    }
}

/// Phase 2. Tool-call content items create or refresh tool messages.
fn phase_tool_calls(state: &mut ReducerState, ctx: &mut ReduceCtx, working: &[NormalizedMessage]) {
    for msg in working {
        let RecordContent::Agent { content } = &msg.content else {
            continue;
        };
        for item in content {
            let AgentItem::ToolCall {
                id,
                name,
                input,
                description,
                started_at,
            } = item
            else {
                continue;
            };
            if let Some(mid) = state.index.tool_message(id, false) {
                refresh_existing_tool(state, ctx, mid, msg, description.as_deref(), *started_at);
            } else {
                create_tool_message(
                    state,
                    ctx,
                    msg,
                    id,
                    name,
                    input,
                    description.as_deref(),
                    *started_at,
                    None,
                );
            }
        }
    }
}

fn refresh_existing_tool(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    mid: MessageId,
    msg: &NormalizedMessage,
    description: Option<&str>,
    started_at: Option<u64>,
) {
    let mut dirty = false;
    let mut became_real = false;
    if let Some(message) = state.message_mut(mid) {
        if message.real_id.is_none() {
            message.real_id = Some(msg.id.clone());
            became_real = true;
            dirty = true;
        }
        if let Some(tool) = message.tool_mut() {
            if let Some(desc) = description {
                if tool.description.as_deref() != Some(desc) {
                    tool.description = Some(desc.to_string());
                    dirty = true;
                }
            }
            if let Some(at) = started_at {
                if tool.started_at != Some(at) {
                    tool.started_at = Some(at);
                    dirty = true;
                }
            }
            // An approved-and-already-completed placeholder flips back to
            // running: execution has now actually begun, so the premature
            // terminal state and result are discarded.
            if became_real
                && tool.state == ToolState::Completed
                && tool
                    .permission
                    .as_ref()
                    .is_some_and(|p| p.status == PermissionStatus::Approved)
            {
                tool.state = ToolState::Running;
                tool.result = None;
                tool.completed_at = None;
            }
        }
    }
    if became_real {
        state.index.register_record_tool(&msg.id, mid);
    }
    if dirty {
        ctx.changed.insert(mid);
    }
}

/// Create a tool message for main thread (`sidechain_id: None`) or as a
/// sidechain child. A stored permission outranks the raw tool-call payload
/// for `input` and `created_at`.
#[allow(clippy::too_many_arguments)]
fn create_tool_message(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    msg: &NormalizedMessage,
    id: &str,
    name: &str,
    input: &Value,
    description: Option<&str>,
    started_at: Option<u64>,
    sidechain_id: Option<&str>,
) -> MessageId {
    let stored = state.index.permission(id).cloned();
    let (seed_input, seed_created) = match &stored {
        Some(p) => (p.arguments.clone(), p.created_at),
        None => (input.clone(), msg.created_at),
    };
    let mut tool = ToolCallState::running(name, seed_input, seed_created);
    tool.description = description.map(str::to_string);
    tool.started_at = started_at;
    if let Some(p) = stored {
        tool.permission = Some(PermissionRecord {
            id: p.id.clone(),
            status: p.status,
            reason: p.reason.clone(),
            mode: p.mode.clone(),
            allowed_tools: p.allowed_tools.clone(),
            decision: p.decision.clone(),
            date: p.completed_at,
        });
        if !matches!(
            p.status,
            PermissionStatus::Approved | PermissionStatus::Pending
        ) {
            tool.state = ToolState::Error;
            tool.completed_at = p.completed_at;
            tool.result = Some(json!({
                "error": p.reason.clone().unwrap_or_else(|| format!("Permission {}", p.status))
            }));
        }
    }
    let is_task_tool = tool.name == state.config.task_tool && tool.state == ToolState::Running;
    let created_at = tool.created_at;
    let todo_input = is_task_tool.then(|| tool.input.clone());
    let mid = state.insert_message(
        Some(msg.id.clone()),
        seed_created,
        ReducerPayload::Tool(tool),
        msg.meta.clone(),
    );
    state.index.register_tool(id, mid, sidechain_id.is_some());
    match sidechain_id {
        Some(sid) => state.push_sidechain_child(sid, mid),
        None => {
            state.index.register_record_tool(&msg.id, mid);
            ctx.changed.insert(mid);
        }
    }
    if sidechain_id.is_none() {
        if let Some(todo_input) = todo_input {
            if created_at > state.latest_todos.timestamp {
                update_todo_snapshot(state, ctx, &todo_input, created_at);
            }
        }
    }
    mid
}

fn update_todo_snapshot(state: &mut ReducerState, ctx: &mut ReduceCtx, input: &Value, at: u64) {
    let Some(todos) = input.get("todos") else {
        return;
    };
    match serde_json::from_value::<Vec<AgentTodo>>(todos.clone()) {
        Ok(todos) => {
            state.latest_todos = TodoSnapshot {
                todos,
                timestamp: at,
            };
            ctx.todos_dirty = true;
        }
        Err(err) => tracing::debug!(%err, "task tool input.todos did not parse"),
    }
}

/// Phase 3. A result lands on its tool if (and only if) the tool is still
/// running; results for unknown or terminal tools are replay noise.
fn phase_tool_results(state: &mut ReducerState, ctx: &mut ReduceCtx, working: &[NormalizedMessage]) {
    for msg in working {
        let RecordContent::Agent { content } = &msg.content else {
            continue;
        };
        for item in content {
            let AgentItem::ToolResult {
                tool_use_id,
                content,
                is_error,
                permission,
            } = item
            else {
                continue;
            };
            let Some(mid) = state.index.tool_message(tool_use_id, false) else {
                tracing::debug!(tool = %tool_use_id, "ignoring result for unknown tool");
                continue;
            };
            if apply_tool_result(
                state,
                mid,
                tool_use_id,
                msg.created_at,
                content,
                *is_error,
                permission.as_ref(),
            ) {
                ctx.changed.insert(mid);
            }
        }
    }
}

/// Returns true when the tool actually transitioned; terminal tools are
/// left untouched (no running -> terminal flapping).
fn apply_tool_result(
    state: &mut ReducerState,
    mid: MessageId,
    tool_id: &str,
    at: u64,
    content: &Value,
    is_error: bool,
    permission: Option<&PermissionUpdate>,
) -> bool {
    let Some(tool) = state.tool_mut(mid) else {
        return false;
    };
    if tool.state.is_terminal() {
        tracing::debug!(%mid, "ignoring duplicate result for terminal tool");
        return false;
    }
    tool.state = if is_error {
        ToolState::Error
    } else {
        ToolState::Completed
    };
    tool.result = Some(content.clone());
    tool.completed_at = Some(at);
    if let Some(update) = permission {
        let perm = tool
            .permission
            .get_or_insert_with(|| PermissionRecord::pending(tool_id.to_string()));
        perm.merge_update(update, at);
    }
    true
}

/// Phase 4. Sidechain messages become children of their owning Task tool.
/// Sidechain tool ids live in their own map, so a sidechain tool never
/// collides with its main-thread permission mirror; completion does
/// propagate sidechain -> main, never the other way.
fn phase_sidechains(
    state: &mut ReducerState,
    ctx: &mut ReduceCtx,
    side: Vec<(NormalizedMessage, String)>,
) {
    for (msg, sid) in side {
        if state.index.is_record_seen(&msg.id) {
            continue;
        }
        match &msg.content {
            RecordContent::User { content } => {
                let (text, images) = NormalizedMessage::flatten_user(content);
                let mid = state.insert_message(
                    Some(msg.id.clone()),
                    msg.created_at,
                    ReducerPayload::UserText { text, images },
                    msg.meta.clone(),
                );
                state.push_sidechain_child(&sid, mid);
            }
            RecordContent::Agent { content } => {
                for item in content {
                    match item {
                        AgentItem::SidechainRoot { prompt, .. } => {
                            let mid = state.insert_message(
                                Some(msg.id.clone()),
                                msg.created_at,
                                ReducerPayload::UserText {
                                    text: prompt.clone(),
                                    images: Vec::new(),
                                },
                                None,
                            );
                            state.push_sidechain_child(&sid, mid);
                        }
                        AgentItem::Text { text } => {
                            let mid = state.insert_message(
                                Some(msg.id.clone()),
                                msg.created_at,
                                ReducerPayload::AgentText { text: text.clone() },
                                msg.meta.clone(),
                            );
                            state.push_sidechain_child(&sid, mid);
                        }
                        AgentItem::ToolCall {
                            id,
                            name,
                            input,
                            description,
                            started_at,
                        } => {
                            if state.index.tool_message(id, true).is_none() {
                                create_tool_message(
                                    state,
                                    ctx,
                                    &msg,
                                    id,
                                    name,
                                    input,
                                    description.as_deref(),
                                    *started_at,
                                    Some(&sid),
                                );
                            }
                        }
                        AgentItem::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                            permission,
                        } => {
                            if let Some(cid) = state.index.tool_message(tool_use_id, true) {
                                apply_tool_result(
                                    state,
                                    cid,
                                    tool_use_id,
                                    msg.created_at,
                                    content,
                                    *is_error,
                                    permission.as_ref(),
                                );
                            }
                            // The main-thread mirror of the same tool id (a
                            // permission message) reflects the sidechain's
                            // actual execution outcome.
                            if let Some(mirror) = state.index.tool_message(tool_use_id, false) {
                                if apply_tool_result(
                                    state,
                                    mirror,
                                    tool_use_id,
                                    msg.created_at,
                                    content,
                                    *is_error,
                                    permission.as_ref(),
                                ) {
                                    ctx.changed.insert(mirror);
                                }
                            }
                        }
                        AgentItem::Summary { .. } => {}
                    }
                }
            }
            RecordContent::Event { event } => {
                let mid = state.insert_message(
                    Some(msg.id.clone()),
                    msg.created_at,
                    ReducerPayload::Event(event.clone()),
                    msg.meta.clone(),
                );
                state.push_sidechain_child(&sid, mid);
            }
        }
        state.index.mark_record(&msg.id, Seen::Consumed);
        // The owning Task tool re-renders its nested children.
        if let Some(owner) = state.index.record_tool(&sid) {
            ctx.changed.insert(owner);
        }
    }
}

/// Phase 5. Remaining event-role records become event messages.
fn phase_events(state: &mut ReducerState, ctx: &mut ReduceCtx, working: &[NormalizedMessage]) {
    for msg in working {
        let RecordContent::Event { event } = &msg.content else {
            continue;
        };
        if state.index.is_record_seen(&msg.id) {
            continue;
        }
        materialize_event(state, ctx, msg, event.clone());
    }
}
