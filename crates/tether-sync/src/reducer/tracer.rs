//! Sidechain tracer. Scans incoming batches and tags each message with the
//! sidechain it belongs to, if any. A message is part of a sidechain when it
//! is causally reachable from a sidechain-root content item via the
//! `uuid`/`parent_uuid` links on the normalized records.
//!
//! The tracer is incremental: links resolved in one batch persist so a
//! child arriving in a later batch still lands in the right sidechain, and
//! messages whose parent is not yet known are retained and re-emitted once
//! the parent shows up.

use crate::wire::{AgentItem, NormalizedMessage, RecordContent};
use std::collections::HashMap;

/// Persistent tracer state, owned by the reducer state.
#[derive(Debug, Default)]
pub struct TracerState {
    /// Message uuid -> sidechain id.
    links: HashMap<String, String>,
    /// Tool use id -> record id of the message that carried the tool call.
    /// The sidechain id downstream is that record id, so the reducer can
    /// re-attach children via `sidechains.get(tool_message.real_id)`.
    tool_records: HashMap<String, String>,
    /// Sidechain-flagged messages whose parent link is not yet resolvable.
    pending: Vec<NormalizedMessage>,
}

impl TracerState {
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TracedMessage {
    pub message: NormalizedMessage,
    pub sidechain_id: Option<String>,
}

/// Tag a batch with sidechain ids, pulling in any previously-pending
/// messages whose parents have now arrived.
pub fn trace(state: &mut TracerState, batch: Vec<NormalizedMessage>) -> Vec<TracedMessage> {
    for msg in &batch {
        if let RecordContent::Agent { content } = &msg.content {
            for item in content {
                if let AgentItem::ToolCall { id, .. } = item {
                    state
                        .tool_records
                        .entry(id.clone())
                        .or_insert_with(|| msg.id.clone());
                }
            }
        }
    }

    // Retained orphans first so parents resolved by this batch reclassify
    // them in arrival order.
    let mut work: Vec<NormalizedMessage> = std::mem::take(&mut state.pending);
    work.extend(batch);

    let mut out = Vec::new();
    loop {
        let mut deferred = Vec::new();
        let mut progressed = false;
        for msg in work {
            match classify(state, &msg) {
                Classification::Main => {
                    out.push(TracedMessage {
                        message: msg,
                        sidechain_id: None,
                    });
                    progressed = true;
                }
                Classification::Sidechain(sid) => {
                    if let Some(uuid) = &msg.uuid {
                        state.links.insert(uuid.clone(), sid.clone());
                    }
                    out.push(TracedMessage {
                        message: msg,
                        sidechain_id: Some(sid),
                    });
                    progressed = true;
                }
                Classification::Unknown => deferred.push(msg),
            }
        }
        work = deferred;
        if work.is_empty() || !progressed {
            break;
        }
    }

    if !work.is_empty() {
        tracing::debug!(
            count = work.len(),
            "retaining sidechain messages with unknown parents"
        );
        state.pending = work;
    }
    out
}

enum Classification {
    Main,
    Sidechain(String),
    Unknown,
}

fn classify(state: &TracerState, msg: &NormalizedMessage) -> Classification {
    if let Some(tool_use_id) = sidechain_root_tool(msg) {
        return match state.tool_records.get(tool_use_id) {
            Some(record_id) => Classification::Sidechain(record_id.clone()),
            None => Classification::Unknown,
        };
    }
    if !msg.is_sidechain {
        return Classification::Main;
    }
    match msg
        .parent_uuid
        .as_deref()
        .and_then(|parent| state.links.get(parent))
    {
        Some(sid) => Classification::Sidechain(sid.clone()),
        None => Classification::Unknown,
    }
}

fn sidechain_root_tool(msg: &NormalizedMessage) -> Option<&str> {
    if let RecordContent::Agent { content } = &msg.content {
        for item in content {
            if let AgentItem::SidechainRoot { tool_use_id, .. } = item {
                return Some(tool_use_id);
            }
        }
    }
    None
}
