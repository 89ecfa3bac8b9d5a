//! Task-list data shapes: the per-item document, the shared order index
//! document, and the combined local state the UI reads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    pub id: String,
    pub title: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_sessions: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// The shared index document. Both lists are disjoint and contain only live
/// item ids, each at most once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrder {
    #[serde(default)]
    pub undone_order: Vec<String>,
    #[serde(default)]
    pub done_order: Vec<String>,
}

impl TaskOrder {
    pub fn remove(&mut self, id: &str) {
        self.undone_order.retain(|x| x != id);
        self.done_order.retain(|x| x != id);
    }

    /// Newly-completed goes to the front: most-recently-completed-first.
    pub fn push_done(&mut self, id: &str) {
        self.remove(id);
        self.done_order.insert(0, id.to_string());
    }

    /// Reopened goes to the back: oldest-pending-first is preserved.
    pub fn push_undone(&mut self, id: &str) {
        self.remove(id);
        self.undone_order.push(id.to_string());
    }

    /// Splice `id` into the destination list at `index`, clamped to the
    /// list's current length.
    pub fn insert_at(&mut self, id: &str, done: bool, index: usize) {
        self.remove(id);
        let list = if done {
            &mut self.done_order
        } else {
            &mut self.undone_order
        };
        let index = index.min(list.len());
        list.insert(index, id.to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.undone_order.iter().any(|x| x == id) || self.done_order.iter().any(|x| x == id)
    }
}

/// Local, optimistically-updated view of the whole collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskList {
    pub items: HashMap<String, TaskItem>,
    pub order: TaskOrder,
}

impl TaskList {
    pub fn undone(&self) -> Vec<&TaskItem> {
        self.order
            .undone_order
            .iter()
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    pub fn done(&self) -> Vec<&TaskItem> {
        self.order
            .done_order
            .iter()
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop order entries whose item is gone and append live items missing
    /// from both lists, deterministically: undone by `created_at`, done by
    /// `updated_at` descending (freshest completion first). Used after a
    /// full resync so any divergence converges to the same shape.
    pub fn rebuild_order(&mut self) {
        self.order.undone_order.retain(|id| self.items.contains_key(id));
        self.order.done_order.retain(|id| self.items.contains_key(id));

        let mut missing: Vec<&TaskItem> = self
            .items
            .values()
            .filter(|item| !self.order.contains(&item.id))
            .collect();
        missing.sort_by_key(|item| (item.created_at, item.id.clone()));
        let mut missing_done: Vec<&TaskItem> =
            missing.iter().copied().filter(|i| i.done).collect();
        missing_done.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let undone_ids: Vec<String> = missing
            .iter()
            .filter(|i| !i.done)
            .map(|i| i.id.clone())
            .collect();
        let done_ids: Vec<String> = missing_done.iter().map(|i| i.id.clone()).collect();
        self.order.undone_order.extend(undone_ids);
        self.order.done_order.extend(done_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, done: bool, created_at: u64, updated_at: u64) -> TaskItem {
        TaskItem {
            id: id.to_string(),
            title: id.to_string(),
            done,
            linked_sessions: Vec::new(),
            created_at,
            updated_at,
        }
    }

    #[test]
    fn push_done_prepends_and_push_undone_appends() {
        let mut order = TaskOrder::default();
        order.push_undone("a");
        order.push_undone("b");
        order.push_done("a");
        assert_eq!(order.undone_order, vec!["b"]);
        assert_eq!(order.done_order, vec!["a"]);

        order.push_done("b");
        assert_eq!(order.done_order, vec!["b", "a"]);

        order.push_undone("b");
        assert_eq!(order.done_order, vec!["a"]);
        assert_eq!(order.undone_order, vec!["b"]);
    }

    #[test]
    fn insert_at_clamps_and_moves() {
        let mut order = TaskOrder::default();
        order.push_undone("a");
        order.push_undone("b");
        order.push_undone("c");
        order.insert_at("c", false, 0);
        assert_eq!(order.undone_order, vec!["c", "a", "b"]);
        order.insert_at("c", false, 99);
        assert_eq!(order.undone_order, vec!["a", "b", "c"]);
        order.insert_at("a", true, 5);
        assert_eq!(order.undone_order, vec!["b", "c"]);
        assert_eq!(order.done_order, vec!["a"]);
    }

    #[test]
    fn rebuild_order_drops_stale_and_appends_missing() {
        let mut list = TaskList::default();
        for it in [
            item("a", false, 10, 10),
            item("b", false, 20, 20),
            item("x", true, 5, 50),
            item("y", true, 6, 40),
        ] {
            list.items.insert(it.id.clone(), it);
        }
        // The index references a deleted item and omits everything else.
        list.order.undone_order = vec!["gone".to_string(), "b".to_string()];
        list.rebuild_order();

        assert_eq!(list.order.undone_order, vec!["b", "a"]);
        // Freshest completion first.
        assert_eq!(list.order.done_order, vec!["x", "y"]);

        // Deterministic: rebuilding again changes nothing.
        let before = list.order.clone();
        list.rebuild_order();
        assert_eq!(list.order, before);
    }
}
