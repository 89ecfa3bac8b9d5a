//! The reducer's working message representation and the public display
//! shape handed to the view layer.

use crate::agent_state::PermissionStatus;
use crate::types::MessageId;
use crate::wire::{AgentEvent, ImageRef, PermissionUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolState {
    Running,
    Completed,
    Error,
}

impl ToolState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolState::Running)
    }
}

/// Permission sub-record linked to a tool call by shared id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub id: String,
    pub status: PermissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    /// Set once authoritative tool-result data has supplied permission info;
    /// agent-state updates are skipped from then on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<u64>,
}

impl PermissionRecord {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PermissionStatus::Pending,
            reason: None,
            mode: None,
            allowed_tools: None,
            decision: None,
            date: None,
        }
    }

    /// Merge authoritative tool-result permission info. An existing
    /// `decision` survives when the incoming data omits one.
    pub fn merge_update(&mut self, update: &PermissionUpdate, fallback_date: u64) {
        self.status = update.status;
        if update.reason.is_some() {
            self.reason = update.reason.clone();
        }
        if update.mode.is_some() {
            self.mode = update.mode.clone();
        }
        if update.allowed_tools.is_some() {
            self.allowed_tools = update.allowed_tools.clone();
        }
        if update.decision.is_some() {
            self.decision = update.decision.clone();
        }
        self.date = Some(update.date.unwrap_or(fallback_date));
    }
}

/// Lifecycle of one tool invocation as tracked by the reducer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallState {
    pub name: String,
    pub state: ToolState,
    pub input: Value,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionRecord>,
}

impl ToolCallState {
    pub fn running(name: impl Into<String>, input: Value, created_at: u64) -> Self {
        Self {
            name: name.into(),
            state: ToolState::Running,
            input,
            created_at,
            started_at: None,
            completed_at: None,
            description: None,
            result: None,
            permission: None,
        }
    }
}

/// Exactly one payload is populated per message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerPayload {
    UserText { text: String, images: Vec<ImageRef> },
    AgentText { text: String },
    Event(AgentEvent),
    Tool(ToolCallState),
}

/// One entry of the reducer's authoritative message store.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducerMessage {
    /// Internal arena id; not stable across process restarts.
    pub id: MessageId,
    /// The originating record id. `None` while the message exists only as a
    /// permission placeholder whose real counterpart hasn't arrived.
    pub real_id: Option<String>,
    /// Assigned once at creation, never reassigned; UI ordering depends on
    /// this surviving any number of later updates.
    pub created_at: u64,
    pub payload: ReducerPayload,
    pub meta: Option<Value>,
}

impl ReducerMessage {
    pub fn tool(&self) -> Option<&ToolCallState> {
        match &self.payload {
            ReducerPayload::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    pub fn tool_mut(&mut self) -> Option<&mut ToolCallState> {
        match &mut self.payload {
            ReducerPayload::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

/// Public message shape for the view layer, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayMessage {
    pub id: MessageId,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(flatten)]
    pub data: DisplayData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DisplayData {
    UserText {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageRef>,
    },
    AgentText {
        text: String,
    },
    ToolCall {
        tool: ToolCallState,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<DisplayMessage>,
    },
    AgentEvent {
        event: AgentEvent,
    },
}
