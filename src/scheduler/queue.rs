//! FIFO ready queue shared by all active tasks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::tasks::model::{SubtaskId, Task, TaskId};

/// A ready subtask waiting for a worker.
///
/// Ordered by `seq`, the global order in which subtasks became ready.
/// Task and subtask ids break ties, which matches creation and discovery
/// order since both are allocated increasingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadyEntry {
    pub seq: u64,
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
}

/// Entries are invalidated lazily: the dispatcher checks each popped entry
/// against the task ([`Task::is_dispatchable`]) and skips dead ones.
pub struct ReadyQueue {
    entries: Mutex<BTreeSet<ReadyEntry>>,
    next_seq: AtomicU64,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeSet::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Give each newly ready subtask its queue position. Subtasks keep a
    /// position they already have.
    pub fn stamp(&self, task: &mut Task, ids: &[SubtaskId]) -> Vec<ReadyEntry> {
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(sub) = task.subtasks.get_mut(*id as usize) else {
                continue;
            };
            let seq = match sub.ready_seq {
                Some(seq) => seq,
                None => {
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    sub.ready_seq = Some(seq);
                    seq
                }
            };
            entries.push(ReadyEntry {
                seq,
                task_id: task.id,
                subtask_id: *id,
            });
        }
        entries
    }

    pub async fn push(&self, entry: ReadyEntry) {
        self.entries.lock().await.insert(entry);
    }

    pub async fn push_all(&self, entries: impl IntoIterator<Item = ReadyEntry>) {
        let mut queue = self.entries.lock().await;
        queue.extend(entries);
    }

    /// Oldest entry, if any.
    pub async fn pop(&self) -> Option<ReadyEntry> {
        self.entries.lock().await.pop_first()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use chrono::Utc;

    fn task(id: TaskId, expr: &str) -> Task {
        let mut task = Task::new(id, "alice", expr, compile(expr).unwrap(), Utc::now());
        task.promote_ready();
        task
    }

    #[tokio::test]
    async fn pops_in_readiness_order_across_tasks() {
        let queue = ReadyQueue::new();
        let mut first = task(1, "1+2+3+4");
        let mut second = task(2, "5*6");

        let a = queue.stamp(&mut first, &[0, 1]);
        let b = queue.stamp(&mut second, &[0]);
        queue.push_all(b).await;
        queue.push_all(a).await;

        let order: Vec<(TaskId, SubtaskId)> = [
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
        ]
        .iter()
        .map(|e| (e.task_id, e.subtask_id))
        .collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0)]);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn restamping_keeps_original_position() {
        let queue = ReadyQueue::new();
        let mut first = task(1, "1+2");
        let mut second = task(2, "3+4");

        let original = queue.stamp(&mut first, &[0]);
        let later = queue.stamp(&mut second, &[0]);
        queue.push_all(later).await;

        // Reclaimed after a revocation: same seq, goes back to the front.
        let again = queue.stamp(&mut first, &[0]);
        assert_eq!(again, original);
        queue.push_all(again).await;
        assert_eq!(queue.pop().await.unwrap().task_id, 1);
    }

    #[tokio::test]
    async fn duplicate_entries_collapse() {
        let queue = ReadyQueue::new();
        let mut t = task(1, "1+2");
        let entries = queue.stamp(&mut t, &[0]);
        queue.push_all(entries.clone()).await;
        queue.push_all(entries).await;
        assert_eq!(queue.len().await, 1);
    }
}
