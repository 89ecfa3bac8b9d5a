//! Versioned key-value document protocol.
//!
//! The server stores opaque ciphertext values under string keys, each with a
//! monotonically increasing version. Writes carry the version the caller
//! last observed per key; the server rejects the whole batch if any live
//! version differs. This is the seam through which both the task-list sync
//! and machine-metadata style updates talk to the relay.

use crate::error::{Error, Result};
use async_trait::async_trait;

/// Expected-version value meaning "the key must not exist yet".
pub const VERSION_ABSENT: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
}

/// One entry of a multi-key atomic write. `value: None` deletes the key.
#[derive(Debug, Clone)]
pub struct KvWrite {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub expected_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvVersion {
    pub key: String,
    pub version: i64,
}

/// Outcome of a `mutate` call. A conflict reports the live versions of the
/// keys whose preconditions failed so the caller can rebase.
#[derive(Debug, Clone)]
pub enum MutateOutcome {
    Applied(Vec<KvVersion>),
    Conflict(Vec<KvVersion>),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvRecord>>;
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<KvRecord>>;
    async fn mutate(&self, writes: Vec<KvWrite>) -> Result<MutateOutcome>;
}

/// Bounded read-rebase-write loop for single-key documents.
///
/// `rebase` receives the latest server value (if any) and returns the bytes
/// to write. On a version conflict the key is refetched and `rebase` runs
/// again against the fresh value; after `attempts` conflicts the error
/// surfaces to the caller rather than being swallowed.
pub async fn update_with_retry<S, F>(
    store: &S,
    key: &str,
    attempts: u32,
    mut rebase: F,
) -> Result<i64>
where
    S: KvStore + ?Sized,
    F: FnMut(Option<&[u8]>) -> Vec<u8> + Send,
{
    for attempt in 0..attempts {
        let current = store.get(key).await?;
        let expected = current.as_ref().map_or(VERSION_ABSENT, |r| r.version);
        let value = rebase(current.as_ref().map(|r| r.value.as_slice()));
        let write = KvWrite {
            key: key.to_string(),
            value: Some(value),
            expected_version: expected,
        };
        match store.mutate(vec![write]).await? {
            MutateOutcome::Applied(versions) => {
                let version = versions
                    .into_iter()
                    .find(|v| v.key == key)
                    .map_or(expected + 1, |v| v.version);
                return Ok(version);
            }
            MutateOutcome::Conflict(_) => {
                tracing::debug!(key, attempt, "version conflict, refetching and rebasing");
            }
        }
    }
    Err(Error::RetryExhausted {
        key: key.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryKv;

    #[tokio::test]
    async fn update_with_retry_rebases_on_conflict() {
        let store = MemoryKv::new();
        store.inject_conflicts(2);
        let version = update_with_retry(&store, "k", 3, |_| b"v1".to_vec())
            .await
            .unwrap();
        assert!(version > 0);
        assert_eq!(store.dump().get("k").map(Vec::as_slice), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn update_with_retry_surfaces_exhaustion() {
        let store = MemoryKv::new();
        store.inject_conflicts(10);
        let err = update_with_retry(&store, "k", 3, |_| b"v1".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RetryExhausted { attempts: 3, .. }
        ));
        assert!(store.dump().is_empty());
    }

    #[tokio::test]
    async fn rebase_sees_the_latest_value() {
        let store = MemoryKv::new();
        update_with_retry(&store, "k", 1, |_| b"a".to_vec())
            .await
            .unwrap();
        update_with_retry(&store, "k", 1, |current| {
            let mut next = current.unwrap_or_default().to_vec();
            next.extend_from_slice(b"b");
            next
        })
        .await
        .unwrap();
        assert_eq!(store.dump().get("k").map(Vec::as_slice), Some(&b"ab"[..]));
    }
}
