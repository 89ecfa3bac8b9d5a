//! Optimistic ordered-collection sync for the task list.
//!
//! Every mutation applies locally first, so the UI never waits on the
//! network, then serializes its server round trip through one lock: the
//! round trip reads the shared index document and the item document, merges
//! the intended change into the *latest server-observed* values, and issues
//! a single multi-key write with expected-version preconditions. Conflicts
//! rebase and retry a bounded number of times before falling back to a full
//! resync; no error path rolls back the optimistic local value.

use crate::config::SyncConfig;
use crate::crypto::{BoxCrypto, decrypt_one, encrypt_one};
use crate::error::{Error, Result};
use crate::kv::{KvRecord, KvStore, KvVersion, KvWrite, MutateOutcome, VERSION_ABSENT};
use crate::tasks::model::{TaskItem, TaskList, TaskOrder};
use crate::types::now_ms;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Default)]
struct LocalState {
    list: TaskList,
    versions: HashMap<String, i64>,
}

pub struct TaskSync<S: KvStore> {
    store: Arc<S>,
    crypto: Arc<dyn BoxCrypto>,
    config: SyncConfig,
    local: Mutex<LocalState>,
    /// Serializes every server round trip for this collection; all
    /// mutations read-then-write the shared index document and must not
    /// interleave. Local optimistic publication happens outside this lock.
    server_lock: tokio::sync::Mutex<()>,
}

impl<S: KvStore> TaskSync<S> {
    pub fn new(store: Arc<S>, crypto: Arc<dyn BoxCrypto>, config: SyncConfig) -> Self {
        Self {
            store,
            crypto,
            config,
            local: Mutex::new(LocalState::default()),
            server_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current optimistic view of the collection.
    pub fn snapshot(&self) -> TaskList {
        self.local().list.clone()
    }

    /// Last observed version for a key, if any.
    pub fn version_of(&self, key: &str) -> Option<i64> {
        self.local().versions.get(key).copied()
    }

    /// Initial rehydration from the server's key-value listing.
    pub async fn hydrate(&self) -> Result<()> {
        self.resync().await
    }

    /// Full resynchronization: refetch the entire collection and overwrite
    /// local state. Idempotent and convergent; a later resync wins by
    /// simple overwrite.
    pub async fn resync(&self) -> Result<()> {
        let _guard = self.server_lock.lock().await;
        self.resync_inner().await
    }

    pub async fn add(&self, title: impl Into<String>) -> Result<TaskItem> {
        let now = now_ms();
        let item = TaskItem {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            done: false,
            linked_sessions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        {
            let mut local = self.local();
            local.list.items.insert(item.id.clone(), item.clone());
            local.list.order.push_undone(&item.id);
        }
        let intended = item.clone();
        self.commit(&item.id, move |server, order| {
            let next = server.unwrap_or_else(|| intended.clone());
            if !order.contains(&next.id) {
                if next.done {
                    order.push_done(&next.id);
                } else {
                    order.push_undone(&next.id);
                }
            }
            Some(next)
        })
        .await?;
        Ok(item)
    }

    pub async fn update_title(&self, id: &str, title: impl Into<String>) -> Result<()> {
        let title = title.into();
        let now = now_ms();
        {
            let mut local = self.local();
            let item = local
                .list
                .items
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            item.title = title.clone();
            item.updated_at = now;
        }
        self.commit(id, move |server, _order| {
            // A concurrent delete is newer information; don't resurrect.
            server.map(|mut item| {
                item.title = title.clone();
                item.updated_at = now;
                item
            })
        })
        .await
    }

    pub async fn update_linked_sessions(&self, id: &str, sessions: Vec<String>) -> Result<()> {
        let now = now_ms();
        {
            let mut local = self.local();
            let item = local
                .list
                .items
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            item.linked_sessions = sessions.clone();
            item.updated_at = now;
        }
        self.commit(id, move |server, _order| {
            server.map(|mut item| {
                item.linked_sessions = sessions.clone();
                item.updated_at = now;
                item
            })
        })
        .await
    }

    /// Flip the done state. Completed items go to the front of the done
    /// list; reopened items go to the back of the undone list.
    pub async fn toggle(&self, id: &str) -> Result<()> {
        let now = now_ms();
        let target = {
            let mut local = self.local();
            let item = local
                .list
                .items
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            let target = !item.done;
            item.done = target;
            item.updated_at = now;
            if target {
                local.list.order.push_done(id);
            } else {
                local.list.order.push_undone(id);
            }
            target
        };
        let id_owned = id.to_string();
        self.commit(id, move |server, order| {
            server.map(|mut item| {
                item.done = target;
                item.updated_at = now;
                if target {
                    order.push_done(&id_owned);
                } else {
                    order.push_undone(&id_owned);
                }
                item
            })
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut local = self.local();
            if local.list.items.remove(id).is_none() {
                return Err(Error::NotFound(format!("task {id}")));
            }
            local.list.order.remove(id);
        }
        let id_owned = id.to_string();
        self.commit(id, move |_server, order| {
            order.remove(&id_owned);
            None
        })
        .await
    }

    /// Move `id` to `index` within the done or undone list. The index is
    /// clamped to the destination list's length; crossing the done/undone
    /// boundary also flips the item's status.
    pub async fn reorder(&self, id: &str, index: usize, done: bool) -> Result<()> {
        let now = now_ms();
        {
            let mut local = self.local();
            let item = local
                .list
                .items
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            if item.done != done {
                item.done = done;
                item.updated_at = now;
            }
            local.list.order.insert_at(id, done, index);
        }
        let id_owned = id.to_string();
        self.commit(id, move |server, order| {
            server.map(|mut item| {
                if item.done != done {
                    item.done = done;
                    item.updated_at = now;
                }
                order.insert_at(&id_owned, done, index);
                item
            })
        })
        .await
    }

    /// The locked read-merge-write cycle shared by every mutation. `merge`
    /// receives the latest server-observed item and index and returns the
    /// item to write (`None` deletes it).
    async fn commit<F>(&self, id: &str, mut merge: F) -> Result<()>
    where
        F: FnMut(Option<TaskItem>, &mut TaskOrder) -> Option<TaskItem> + Send,
    {
        let _guard = self.server_lock.lock().await;
        let item_key = self.item_key(id);
        let index_key = self.index_key();
        let mut attempt = 0u32;
        loop {
            let (server_item, item_version) = match self.store.get(&item_key).await? {
                Some(rec) => (self.decode_item(&rec)?, rec.version),
                None => (None, VERSION_ABSENT),
            };
            let (mut order, index_version) = match self.store.get(&index_key).await? {
                Some(rec) => (self.decode_order(&rec)?.unwrap_or_default(), rec.version),
                None => (TaskOrder::default(), VERSION_ABSENT),
            };
            let next_item = merge(server_item, &mut order);
            let item_value = match &next_item {
                Some(item) => Some(self.encode(&serde_json::to_value(item)?)?),
                None => None,
            };
            let writes = vec![
                KvWrite {
                    key: item_key.clone(),
                    value: item_value,
                    expected_version: item_version,
                },
                KvWrite {
                    key: index_key.clone(),
                    value: Some(self.encode(&serde_json::to_value(&order)?)?),
                    expected_version: index_version,
                },
            ];
            match self.store.mutate(writes).await {
                Ok(MutateOutcome::Applied(versions)) => {
                    self.reconcile(id, next_item, order, &versions);
                    return Ok(());
                }
                Ok(MutateOutcome::Conflict(_)) => {
                    if attempt >= self.config.write_retries {
                        tracing::warn!(
                            key = %item_key,
                            "task write conflicts exhausted, resyncing collection"
                        );
                        return self.resync_inner().await;
                    }
                    attempt += 1;
                    tracing::debug!(key = %item_key, attempt, "task write conflict, rebasing");
                }
                Err(err) => {
                    tracing::warn!(%err, "task write failed, resyncing collection");
                    return self.resync_inner().await;
                }
            }
        }
    }

    /// Apply exactly what the server accepted, not the optimistic guess.
    fn reconcile(
        &self,
        id: &str,
        item: Option<TaskItem>,
        order: TaskOrder,
        versions: &[KvVersion],
    ) {
        let mut local = self.local();
        match item {
            Some(item) => {
                local.list.items.insert(id.to_string(), item);
            }
            None => {
                local.list.items.remove(id);
            }
        }
        local.list.order = order;
        for v in versions {
            if v.version < 0 {
                local.versions.remove(&v.key);
            } else {
                local.versions.insert(v.key.clone(), v.version);
            }
        }
    }

    // Requires the server lock to be held by the caller.
    async fn resync_inner(&self) -> Result<()> {
        let records = self
            .store
            .list(&self.items_prefix(), self.config.list_page_size)
            .await?;
        let index_rec = self.store.get(&self.index_key()).await?;

        // Bulk decrypt; one slot per record, tampered slots dropped.
        let ciphertexts: Vec<Vec<u8>> = records.iter().map(|r| r.value.clone()).collect();
        let plaintexts = self.crypto.decrypt(&ciphertexts)?;

        let mut list = TaskList::default();
        let mut versions = HashMap::new();
        for (rec, plaintext) in records.iter().zip(plaintexts) {
            let Some(value) = plaintext else {
                tracing::debug!(key = %rec.key, "dropping undecryptable task item");
                continue;
            };
            match serde_json::from_value::<TaskItem>(value) {
                Ok(item) => {
                    versions.insert(rec.key.clone(), rec.version);
                    list.items.insert(item.id.clone(), item);
                }
                Err(err) => {
                    tracing::debug!(key = %rec.key, %err, "dropping task item with unknown shape");
                }
            }
        }
        if let Some(rec) = index_rec {
            versions.insert(rec.key.clone(), rec.version);
            if let Some(order) = self.decode_order(&rec)? {
                list.order = order;
            }
        }
        list.rebuild_order();

        let mut local = self.local();
        local.list = list;
        local.versions = versions;
        Ok(())
    }

    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.config.task_prefix)
    }

    fn item_key(&self, id: &str) -> String {
        format!("{}item:{id}", self.config.task_prefix)
    }

    fn items_prefix(&self) -> String {
        format!("{}item:", self.config.task_prefix)
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        encrypt_one(self.crypto.as_ref(), value)
    }

    fn decode_item(&self, rec: &KvRecord) -> Result<Option<TaskItem>> {
        let Some(value) = decrypt_one(self.crypto.as_ref(), &rec.value)? else {
            tracing::debug!(key = %rec.key, "undecryptable task item");
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(item) => Ok(Some(item)),
            Err(err) => {
                tracing::debug!(key = %rec.key, %err, "task item with unknown shape");
                Ok(None)
            }
        }
    }

    fn decode_order(&self, rec: &KvRecord) -> Result<Option<TaskOrder>> {
        let Some(value) = decrypt_one(self.crypto.as_ref(), &rec.value)? else {
            tracing::debug!(key = %rec.key, "undecryptable task index");
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(order) => Ok(Some(order)),
            Err(err) => {
                tracing::debug!(key = %rec.key, %err, "task index with unknown shape");
                Ok(None)
            }
        }
    }
}

impl<S: KvStore> std::fmt::Debug for TaskSync<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSync")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
