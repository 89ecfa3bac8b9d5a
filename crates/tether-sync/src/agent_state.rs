//! Decrypted view of the session's live agent-state document: which tool
//! invocations are awaiting a human decision, and which decisions have
//! already been made. Produced by the caller from the relay's agent-state
//! snapshot; consumed by the reducer's Phase 0.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    Canceled,
}

/// A permission request still awaiting a decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    pub created_at: u64,
}

/// A permission request the human has already decided on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    pub created_at: u64,
    pub completed_at: u64,
    pub status: PermissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

/// Snapshot of the agent-state document, keyed by permission id. `BTreeMap`
/// keeps Phase 0's synthesis order deterministic across calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateSnapshot {
    #[serde(default)]
    pub requests: BTreeMap<String, PermissionRequest>,
    #[serde(default)]
    pub completed_requests: BTreeMap<String, CompletedRequest>,
}
