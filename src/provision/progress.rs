use crate::provision::types::{TaskId, TaskSnapshot};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct TaskEntry {
    snapshot: TaskSnapshot,
    touched: Instant,
}

/// Task id → latest snapshot. Pollers read a shared copy of the table;
/// writers swap in an updated copy.
#[derive(Debug, Default)]
pub struct ProgressStore {
    tasks: ArcSwap<HashMap<TaskId, TaskEntry>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown ids read as `{0, queued, "waiting"}`.
    pub fn get(&self, id: TaskId) -> TaskSnapshot {
        self.tasks
            .load()
            .get(&id)
            .map(|entry| entry.snapshot.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.load().contains_key(&id)
    }

    /// Writes `snapshot` for `id`, unless the stored task is already terminal.
    /// Percentages never go backwards and completion always reads 100.
    /// Returns whether the write was applied.
    pub fn set(&self, id: TaskId, snapshot: TaskSnapshot) -> bool {
        let now = Instant::now();
        let previous = self.tasks.rcu(|current| {
            let mut next = HashMap::clone(current);
            let base = current
                .get(&id)
                .map(|entry| entry.snapshot.clone())
                .unwrap_or_default();
            if let Some(updated) = base.advance(snapshot.clone()) {
                next.insert(
                    id,
                    TaskEntry {
                        snapshot: updated,
                        touched: now,
                    },
                );
            }
            next
        });

        let applied = previous
            .get(&id)
            .is_none_or(|entry| entry.snapshot.advance(snapshot.clone()).is_some());
        if !applied {
            tracing::warn!("Ignoring out-of-order update for task {}: {:?}", id, snapshot);
        }
        applied
    }

    pub fn remove(&self, id: TaskId) -> Option<TaskSnapshot> {
        let previous = self.tasks.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&id);
            next
        });
        previous.get(&id).map(|entry| entry.snapshot.clone())
    }

    /// Drops finished tasks whose last update is older than `ttl`.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let is_expired = |entry: &TaskEntry| {
            entry.snapshot.status.is_terminal() && now.duration_since(entry.touched) >= ttl
        };

        let previous = self.tasks.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.retain(|_, entry| !is_expired(entry));
            next
        });
        let evicted = previous.values().filter(|entry| is_expired(entry)).count();
        if evicted > 0 {
            tracing::info!("Evicted {} finished tasks from the progress table", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.tasks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot_all(&self) -> Vec<(TaskId, TaskSnapshot)> {
        let tasks: Arc<HashMap<TaskId, TaskEntry>> = self.tasks.load_full();
        tasks
            .iter()
            .map(|(id, entry)| (*id, entry.snapshot.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::types::TaskStatus;

    #[test]
    fn test_unknown_task_reads_waiting() {
        let store = ProgressStore::new();
        let snapshot = store.get(TaskId::new());
        assert_eq!(snapshot.percentage, 0);
        assert_eq!(snapshot.status, TaskStatus::Queued);
        assert_eq!(snapshot.message, "waiting");
    }

    #[test]
    fn test_terminal_state_is_final() {
        let store = ProgressStore::new();
        let id = TaskId::new();
        assert!(store.set(id, TaskSnapshot::running(50, "half")));
        assert!(store.set(id, TaskSnapshot::failed(50, "boom")));
        assert!(!store.set(id, TaskSnapshot::running(90, "late")));
        assert!(!store.set(id, TaskSnapshot::completed()));

        let snapshot = store.get(id);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.message, "Error: boom");
    }

    #[test]
    fn test_percentage_never_decreases() {
        let store = ProgressStore::new();
        let id = TaskId::new();
        store.set(id, TaskSnapshot::running(60, "local"));
        store.set(id, TaskSnapshot::running(30, "out of order"));
        assert_eq!(store.get(id).percentage, 60);
    }

    #[test]
    fn test_remove_and_evict() {
        let store = ProgressStore::new();
        let done = TaskId::new();
        let busy = TaskId::new();
        store.set(done, TaskSnapshot::completed());
        store.set(busy, TaskSnapshot::running(10, "connecting"));

        assert_eq!(store.evict_expired(Duration::from_secs(3600)), 0);
        assert_eq!(store.evict_expired(Duration::ZERO), 1);
        assert!(!store.contains(done));
        assert!(store.contains(busy));

        assert_eq!(store.remove(busy).unwrap().percentage, 10);
        assert!(store.is_empty());
        assert_eq!(store.get(busy), TaskSnapshot::waiting());
    }

    #[test]
    fn test_concurrent_writers_keep_their_own_keys() {
        let store = Arc::new(ProgressStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let id = TaskId::new();
                    for pct in (0..=100).step_by(10) {
                        store.set(id, TaskSnapshot::running(pct, format!("{}%", pct)));
                    }
                    store.set(id, TaskSnapshot::completed());
                    id
                })
            })
            .collect();

        for handle in handles {
            let id = handle.join().unwrap();
            assert_eq!(store.get(id), TaskSnapshot::completed());
        }
        assert_eq!(store.len(), 8);
    }
}
