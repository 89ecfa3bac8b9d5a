//! Long-lived reducer state: the message arena, the dedup/linkage index,
//! sidechain storage, and the derived todo/usage snapshots.

use crate::agent_state::PermissionStatus;
use crate::config::SyncConfig;
use crate::reducer::message::{
    DisplayData, DisplayMessage, ReducerMessage, ReducerPayload, ToolCallState,
};
use crate::reducer::tracer::TracerState;
use crate::types::MessageId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Dedup marker for a canonical record id: either the message it produced,
/// or a sentinel for records consumed without a single owning message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    Message(MessageId),
    Consumed,
}

/// Permission side-table entry, used to splice late-arriving tool-call
/// content onto an already-known permission, or vice versa.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPermission {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    pub status: PermissionStatus,
    pub reason: Option<String>,
    pub mode: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub decision: Option<String>,
}

/// The side tables that must stay consistent with each other. All mutation
/// goes through accessors so the two tool maps can't drift apart.
#[derive(Debug, Default)]
pub struct MessageIndex {
    tool_to_message: HashMap<String, MessageId>,
    sidechain_tool_to_message: HashMap<String, MessageId>,
    permissions: HashMap<String, StoredPermission>,
    local_ids: HashMap<String, MessageId>,
    record_ids: HashMap<String, Seen>,
    /// Record id -> tool-call message created from that record. Lets Phase 4
    /// find the owning Task tool of a sidechain by the sidechain's id.
    record_tools: HashMap<String, MessageId>,
}

impl MessageIndex {
    pub fn is_record_seen(&self, record_id: &str) -> bool {
        self.record_ids.contains_key(record_id)
    }

    /// First writer wins; a record is processed at most once per lifetime.
    pub fn mark_record(&mut self, record_id: &str, seen: Seen) {
        self.record_ids
            .entry(record_id.to_string())
            .or_insert(seen);
    }

    pub fn is_local_seen(&self, local_id: &str) -> bool {
        self.local_ids.contains_key(local_id)
    }

    pub fn mark_local(&mut self, local_id: &str, id: MessageId) {
        self.local_ids.entry(local_id.to_string()).or_insert(id);
    }

    /// A tool id maps to at most one message per thread; the sidechain map
    /// is independent so a sidechain tool can't collide with its main-thread
    /// mirror.
    pub fn register_tool(&mut self, tool_id: &str, id: MessageId, sidechain: bool) {
        let map = if sidechain {
            &mut self.sidechain_tool_to_message
        } else {
            &mut self.tool_to_message
        };
        map.entry(tool_id.to_string()).or_insert(id);
    }

    pub fn tool_message(&self, tool_id: &str, sidechain: bool) -> Option<MessageId> {
        let map = if sidechain {
            &self.sidechain_tool_to_message
        } else {
            &self.tool_to_message
        };
        map.get(tool_id).copied()
    }

    pub fn store_permission(&mut self, permission: StoredPermission) {
        self.permissions.insert(permission.id.clone(), permission);
    }

    pub fn permission(&self, id: &str) -> Option<&StoredPermission> {
        self.permissions.get(id)
    }

    pub fn register_record_tool(&mut self, record_id: &str, id: MessageId) {
        self.record_tools.insert(record_id.to_string(), id);
    }

    /// The tool-call message created from `record_id`, if any.
    pub fn record_tool(&self, record_id: &str) -> Option<MessageId> {
        self.record_tools.get(record_id).copied()
    }
}

/// Agent-authored todo item, as carried in the task tool's `input.todos`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTodo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    pub status: AgentTodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// Most-recent-wins snapshot of the agent's todo list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TodoSnapshot {
    pub todos: Vec<AgentTodo>,
    pub timestamp: u64,
}

/// Most-recent-wins token accounting snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub timestamp: u64,
}

impl UsageSnapshot {
    pub fn zeroed(timestamp: u64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

/// One instance per conversation stream, mutated in place across `reduce`
/// calls. Never serialized; on cold start the caller replays the full
/// history and an equivalent state is rebuilt.
#[derive(Debug)]
pub struct ReducerState {
    pub(crate) config: SyncConfig,
    next_id: u64,
    pub(crate) index: MessageIndex,
    messages: HashMap<MessageId, ReducerMessage>,
    /// Parent tool's record id -> ordered children.
    sidechains: HashMap<String, Vec<MessageId>>,
    pub(crate) tracer: TracerState,
    pub(crate) latest_todos: TodoSnapshot,
    pub(crate) latest_usage: UsageSnapshot,
}

impl Default for ReducerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReducerState {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self {
            config,
            next_id: 0,
            index: MessageIndex::default(),
            messages: HashMap::new(),
            sidechains: HashMap::new(),
            tracer: TracerState::default(),
            latest_todos: TodoSnapshot::default(),
            latest_usage: UsageSnapshot::default(),
        }
    }

    pub(crate) fn alloc(&mut self) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Allocate and store a new message. `created_at` is fixed here for the
    /// lifetime of the message.
    pub(crate) fn insert_message(
        &mut self,
        real_id: Option<String>,
        created_at: u64,
        payload: ReducerPayload,
        meta: Option<Value>,
    ) -> MessageId {
        let id = self.alloc();
        self.messages.insert(
            id,
            ReducerMessage {
                id,
                real_id,
                created_at,
                payload,
                meta,
            },
        );
        id
    }

    pub fn message(&self, id: MessageId) -> Option<&ReducerMessage> {
        self.messages.get(&id)
    }

    pub(crate) fn message_mut(&mut self, id: MessageId) -> Option<&mut ReducerMessage> {
        self.messages.get_mut(&id)
    }

    pub(crate) fn tool_mut(&mut self, id: MessageId) -> Option<&mut ToolCallState> {
        self.messages.get_mut(&id).and_then(ReducerMessage::tool_mut)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Render the whole history in allocation order. Incremental callers
    /// should prefer the changed set in [`ReduceOutput`]; this is for full
    /// redraws and cold-start verification.
    ///
    /// [`ReduceOutput`]: crate::reducer::ReduceOutput
    pub fn messages_snapshot(&self) -> Vec<DisplayMessage> {
        (0..self.next_id)
            .filter_map(|i| self.display_message(MessageId(i)))
            .collect()
    }

    pub fn latest_todos(&self) -> &TodoSnapshot {
        &self.latest_todos
    }

    pub fn latest_usage(&self) -> &UsageSnapshot {
        &self.latest_usage
    }

    pub(crate) fn push_sidechain_child(&mut self, sidechain_id: &str, child: MessageId) {
        self.sidechains
            .entry(sidechain_id.to_string())
            .or_default()
            .push(child);
    }

    pub fn sidechain_children(&self, sidechain_id: &str) -> &[MessageId] {
        self.sidechains
            .get(sidechain_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Convert a stored message to the public shape. Tool-call messages
    /// embed their resolved sidechain children at conversion time, not at
    /// storage time.
    pub fn display_message(&self, id: MessageId) -> Option<DisplayMessage> {
        self.display_message_guarded(id, &mut Vec::new())
    }

    /// `path` holds the tool-message ancestry of the current conversion. A
    /// crafted record can make a tool call its own sidechain ancestor; such
    /// a child is dropped instead of recursing forever.
    fn display_message_guarded(
        &self,
        id: MessageId,
        path: &mut Vec<MessageId>,
    ) -> Option<DisplayMessage> {
        if path.contains(&id) {
            tracing::warn!(%id, "cycle in sidechain children, truncating");
            return None;
        }
        let msg = self.messages.get(&id)?;
        let data = match &msg.payload {
            ReducerPayload::UserText { text, images } => DisplayData::UserText {
                text: text.clone(),
                images: images.clone(),
            },
            ReducerPayload::AgentText { text } => DisplayData::AgentText { text: text.clone() },
            ReducerPayload::Event(event) => DisplayData::AgentEvent {
                event: event.clone(),
            },
            ReducerPayload::Tool(tool) => {
                path.push(id);
                let children = msg
                    .real_id
                    .as_deref()
                    .map(|rid| self.sidechain_children(rid))
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(|child| self.display_message_guarded(*child, path))
                    .collect();
                path.pop();
                DisplayData::ToolCall {
                    tool: tool.clone(),
                    children,
                }
            }
        };
        Some(DisplayMessage {
            id: msg.id,
            created_at: msg.created_at,
            meta: msg.meta.clone(),
            data,
        })
    }
}
