//! In-memory task registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};

use super::model::{Task, TaskId};
use crate::error::TaskError;

/// Shared handle to one task. All mutation of the task happens under this lock.
pub type TaskHandle = Arc<Mutex<Task>>;

/// Owns every task record.
///
/// The map lock is only held long enough to clone a handle; it is never
/// held while waiting on a task lock.
pub struct TaskRegistry {
    tasks: RwLock<BTreeMap<TaskId, TaskHandle>>,
    /// Tasks that are neither completed nor failed.
    active: RwLock<BTreeSet<TaskId>>,
    next_id: AtomicU64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            active: RwLock::new(BTreeSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fresh task id. Ids are never reused.
    pub fn allocate_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future ids come after `max_id`.
    pub fn reserve_after(&self, max_id: TaskId) {
        self.next_id.fetch_max(max_id + 1, Ordering::Relaxed);
    }

    /// Insert a fully built task.
    pub async fn insert(&self, task: Task) -> TaskHandle {
        let id = task.id;
        let terminal = task.status.is_terminal();
        let handle = Arc::new(Mutex::new(task));
        self.tasks.write().await.insert(id, Arc::clone(&handle));
        if !terminal {
            self.active.write().await.insert(id);
        }
        handle
    }

    pub async fn handle(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.read().await.get(&id).cloned()
    }

    /// Snapshot of one task.
    pub async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        let handle = self.handle(id).await.ok_or(TaskError::NotFound { id })?;
        let task = handle.lock().await;
        Ok(task.clone())
    }

    /// Snapshots of an owner's tasks, newest first.
    pub async fn list(&self, owner_id: &str) -> Vec<Task> {
        let handles: Vec<TaskHandle> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::new();
        for handle in handles.iter().rev() {
            let task = handle.lock().await;
            if task.owner_id == owner_id {
                tasks.push(task.clone());
            }
        }
        tasks
    }

    /// Handles of tasks that still have work outstanding.
    pub async fn active_handles(&self) -> Vec<TaskHandle> {
        let ids: Vec<TaskId> = self.active.read().await.iter().copied().collect();
        let tasks = self.tasks.read().await;
        ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
    }

    /// Drop a task from the active set once it is terminal.
    pub async fn mark_finished(&self, id: TaskId) {
        self.active.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use chrono::Utc;

    fn make(registry: &TaskRegistry, owner: &str, expr: &str) -> Task {
        Task::new(
            registry.allocate_id(),
            owner,
            expr,
            compile(expr).unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let registry = TaskRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);

        registry.reserve_after(100);
        assert_eq!(registry.allocate_id(), 101);
        registry.reserve_after(5);
        assert_eq!(registry.allocate_id(), 102);
    }

    #[tokio::test]
    async fn list_is_per_owner_and_newest_first() {
        let registry = TaskRegistry::new();
        let first = make(&registry, "alice", "1+1");
        let other = make(&registry, "bob", "2+2");
        let second = make(&registry, "alice", "3+3");
        registry.insert(first.clone()).await;
        registry.insert(other).await;
        registry.insert(second.clone()).await;

        let ids: Vec<_> = registry.list("alice").await.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert!(registry.list("carol").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.get(9).await,
            Err(TaskError::NotFound { id: 9 })
        ));
    }

    #[tokio::test]
    async fn terminal_tasks_are_not_active() {
        let registry = TaskRegistry::new();
        let literal = make(&registry, "alice", "7");
        let pending = make(&registry, "alice", "1+2");
        let pending_id = pending.id;
        registry.insert(literal).await;
        registry.insert(pending).await;

        assert_eq!(registry.active_handles().await.len(), 1);
        registry.mark_finished(pending_id).await;
        assert!(registry.active_handles().await.is_empty());
        assert_eq!(registry.len().await, 2);
    }
}
