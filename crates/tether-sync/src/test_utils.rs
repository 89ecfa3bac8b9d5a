//! In-memory fakes and record builders shared by unit tests and downstream
//! crates' integration tests (behind the `test-utils` feature).

use crate::crypto::BoxCrypto;
use crate::error::Result;
use crate::kv::{KvRecord, KvStore, KvVersion, KvWrite, MutateOutcome, VERSION_ABSENT};
use crate::wire::{AgentEvent, AgentItem, NormalizedMessage, RecordContent, UserPayload};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Versioned in-memory [`KvStore`] with injectable conflicts.
///
/// Versions increase monotonically per key. `inject_conflicts(n)` makes the
/// next `n` mutate calls fail with a version conflict regardless of their
/// preconditions, which exercises rebase/retry paths deterministically.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (Vec<u8>, i64)>>,
    forced_conflicts: AtomicU32,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Current contents, key -> value bytes.
    pub fn dump(&self) -> HashMap<String, Vec<u8>> {
        self.lock()
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    pub fn version(&self, key: &str) -> Option<i64> {
        self.lock().get(key).map(|(_, v)| *v)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, i64)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvRecord>> {
        Ok(self.lock().get(key).map(|(value, version)| KvRecord {
            key: key.to_string(),
            value: value.clone(),
            version: *version,
        }))
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<KvRecord>> {
        let entries = self.lock();
        let mut records: Vec<KvRecord> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (value, version))| KvRecord {
                key: k.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records.truncate(limit);
        Ok(records)
    }

    async fn mutate(&self, writes: Vec<KvWrite>) -> Result<MutateOutcome> {
        // Suspend once so tests that race two mutations actually interleave.
        tokio::task::yield_now().await;
        let mut entries = self.lock();

        if self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let live = writes
                .iter()
                .map(|w| KvVersion {
                    key: w.key.clone(),
                    version: entries
                        .get(&w.key)
                        .map_or(VERSION_ABSENT, |(_, v)| *v),
                })
                .collect();
            return Ok(MutateOutcome::Conflict(live));
        }

        let mut failed = Vec::new();
        for write in &writes {
            let live = entries.get(&write.key).map_or(VERSION_ABSENT, |(_, v)| *v);
            if live != write.expected_version {
                failed.push(KvVersion {
                    key: write.key.clone(),
                    version: live,
                });
            }
        }
        if !failed.is_empty() {
            return Ok(MutateOutcome::Conflict(failed));
        }

        let mut applied = Vec::new();
        for write in writes {
            match write.value {
                Some(value) => {
                    let version = write.expected_version.max(0) + 1;
                    entries.insert(write.key.clone(), (value, version));
                    applied.push(KvVersion {
                        key: write.key,
                        version,
                    });
                }
                None => {
                    entries.remove(&write.key);
                    applied.push(KvVersion {
                        key: write.key,
                        version: VERSION_ABSENT,
                    });
                }
            }
        }
        Ok(MutateOutcome::Applied(applied))
    }
}

/// Identity "encryption": plaintext JSON bytes. Anything that fails to parse
/// back decodes as tampered (`None`), which is exactly what tests want for
/// exercising tamper paths.
#[derive(Debug, Clone, Copy)]
pub struct PlainCrypto;

impl BoxCrypto for PlainCrypto {
    fn encrypt(&self, items: &[Value]) -> Result<Vec<Vec<u8>>> {
        items
            .iter()
            .map(|v| serde_json::to_vec(v).map_err(Into::into))
            .collect()
    }

    fn decrypt(&self, ciphertexts: &[Vec<u8>]) -> Result<Vec<Option<Value>>> {
        Ok(ciphertexts
            .iter()
            .map(|c| serde_json::from_slice(c).ok())
            .collect())
    }

    fn encrypt_blob(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decrypt_blob(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(Some(bytes.to_vec()))
    }
}

pub fn user_record(id: &str, at: u64, text: &str) -> NormalizedMessage {
    NormalizedMessage {
        id: id.to_string(),
        local_id: None,
        created_at: at,
        is_sidechain: false,
        uuid: None,
        parent_uuid: None,
        content: RecordContent::User {
            content: UserPayload::Text(text.to_string()),
        },
        meta: None,
        usage: None,
    }
}

pub fn agent_record(id: &str, at: u64, items: Vec<AgentItem>) -> NormalizedMessage {
    NormalizedMessage {
        id: id.to_string(),
        local_id: None,
        created_at: at,
        is_sidechain: false,
        uuid: None,
        parent_uuid: None,
        content: RecordContent::Agent { content: items },
        meta: None,
        usage: None,
    }
}

pub fn event_record(id: &str, at: u64, event: AgentEvent) -> NormalizedMessage {
    NormalizedMessage {
        id: id.to_string(),
        local_id: None,
        created_at: at,
        is_sidechain: false,
        uuid: None,
        parent_uuid: None,
        content: RecordContent::Event { event },
        meta: None,
        usage: None,
    }
}

pub fn tool_call(tool_id: &str, name: &str, input: Value) -> AgentItem {
    AgentItem::ToolCall {
        id: tool_id.to_string(),
        name: name.to_string(),
        input,
        description: None,
        started_at: None,
    }
}

pub fn tool_result(tool_id: &str, content: Value, is_error: bool) -> AgentItem {
    AgentItem::ToolResult {
        tool_use_id: tool_id.to_string(),
        content,
        is_error,
        permission: None,
    }
}
