//! The orchestrator: owns every registry and implements the task lifecycle.
//!
//! Lock order is task → ready queue → worker directory. The delay policy
//! and event bus are leaves. No code path waits on a task lock while
//! holding the queue or directory lock.

mod aggregate;
mod dispatch;
mod liveness;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::compiler::compile;
use crate::config::SchedulerConfig;
use crate::delay::{DelayPolicy, Delays};
use crate::error::{Error, Result, TaskError};
use crate::events::{Event, EventBus, EventFilter, Subscription};
use crate::scheduler::ReadyQueue;
use crate::store::Database;
use crate::tasks::{Task, TaskId, TaskRegistry};
use crate::workers::directory::WorkerDirectory;
use crate::workers::model::{AssignmentRef, WorkerRecord, WorkerSummary};

pub use sweeper::spawn_sweeper;

/// Counts from startup recovery.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub loaded: usize,
    pub resumed: usize,
}

pub struct Orchestrator {
    config: SchedulerConfig,
    registry: TaskRegistry,
    queue: ReadyQueue,
    directory: WorkerDirectory,
    delays: DelayPolicy,
    bus: EventBus,
    store: Option<Arc<dyn Database>>,
}

impl Orchestrator {
    /// Build an orchestrator. Without a store everything lives in memory.
    pub fn new(config: SchedulerConfig, store: Option<Arc<dyn Database>>) -> Arc<Self> {
        Arc::new(Self {
            bus: EventBus::new(config.event_buffer),
            config,
            registry: TaskRegistry::new(),
            queue: ReadyQueue::new(),
            directory: WorkerDirectory::new(),
            delays: DelayPolicy::new(),
            store,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Compile `expression` and register it as a new task for `owner_id`.
    pub async fn create_task(&self, owner_id: &str, expression: &str) -> Result<Task> {
        let dag = compile(expression)?;
        let now = Utc::now();
        let mut task = Task::new(
            self.registry.allocate_id(),
            owner_id,
            expression.trim(),
            dag,
            now,
        );
        let ready = task.promote_ready();
        let entries = self.queue.stamp(&mut task, &ready);

        if let Some(store) = &self.store {
            store.insert_task(&task).await?;
        }

        let snapshot = task.clone();
        self.registry.insert(task).await;
        self.queue.push_all(entries).await;

        info!(
            task_id = snapshot.id,
            owner_id = %snapshot.owner_id,
            subtasks = snapshot.subtasks.len(),
            ready = ready.len(),
            "Task created"
        );
        self.publish_task(&snapshot);
        Ok(snapshot)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        Ok(self.registry.get(id).await?)
    }

    /// Like [`Orchestrator::get_task`], but tasks of other owners are not found.
    pub async fn get_task_for(&self, owner_id: &str, id: TaskId) -> Result<Task> {
        let task = self.registry.get(id).await?;
        if task.owner_id != owner_id {
            return Err(TaskError::NotFound { id }.into());
        }
        Ok(task)
    }

    /// An owner's tasks, newest first.
    pub async fn list_tasks(&self, owner_id: &str) -> Vec<Task> {
        self.registry.list(owner_id).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn workers(&self) -> Vec<WorkerSummary> {
        self.directory
            .list()
            .await
            .iter()
            .map(WorkerRecord::summary)
            .collect()
    }

    pub async fn worker(&self, id: &str) -> Option<WorkerRecord> {
        self.directory.get(id).await
    }

    // ── Delays ──────────────────────────────────────────────────────

    pub async fn delays(&self) -> Delays {
        self.delays.snapshot().await
    }

    /// Apply a partial delay update in whole seconds and persist it.
    ///
    /// A failed save leaves the in-memory policy unchanged.
    pub async fn update_delays(&self, update: &HashMap<String, i64>) -> Result<Delays> {
        let store = self.store.clone();
        self.delays
            .apply_update_with(update, |next| async move {
                if let Some(store) = store {
                    store.save_delays(&next).await?;
                }
                Ok::<_, Error>(())
            })
            .await
    }

    pub fn delay_policy(&self) -> &DelayPolicy {
        &self.delays
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    fn publish_task(&self, task: &Task) {
        self.bus.publish(Event::task(task));
    }

    fn publish_worker(&self, record: &WorkerRecord) {
        self.bus.publish(Event::worker(record));
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Write a task back to storage. Failures are logged; in-memory state
    /// stays authoritative.
    async fn persist(&self, task: &Task) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_task(task).await {
                warn!(task_id = task.id, error = %e, "Failed to persist task");
            }
        }
    }

    /// Free `worker_id` if it still holds `assignment`.
    async fn release_worker(&self, worker_id: &str, assignment: AssignmentRef) {
        if let Some(record) = self.directory.release(worker_id, assignment).await {
            self.publish_worker(&record);
        }
    }

    /// Reload stored delays and tasks after a restart.
    ///
    /// Unfinished tasks are rescheduled; assignments held before the
    /// restart are revoked since their workers are gone.
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let Some(store) = &self.store else {
            return Ok(RecoveryStats::default());
        };

        let stored = store.load_delays().await?;
        if stored.is_empty() {
            store.save_delays(&self.delays.snapshot().await).await?;
        } else {
            self.delays.load(stored).await;
        }

        self.registry.reserve_after(store.max_task_id().await?);

        let now = Utc::now();
        let mut stats = RecoveryStats::default();
        for mut task in store.load_tasks().await? {
            stats.loaded += 1;
            if task.status.is_terminal() {
                self.registry.insert(task).await;
                continue;
            }
            let ready = task.resume(now);
            let entries = self.queue.stamp(&mut task, &ready);
            self.persist(&task).await;
            self.registry.insert(task).await;
            self.queue.push_all(entries).await;
            stats.resumed += 1;
        }

        info!(
            loaded = stats.loaded,
            resumed = stats.resumed,
            "Recovered tasks from storage"
        );
        Ok(stats)
    }
}

/// Convert a std duration for date arithmetic, saturating at a large bound.
pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use crate::store::LibSqlBackend;
    use crate::tasks::TaskStatus;

    fn orchestrator() -> Arc<Orchestrator> {
        Orchestrator::new(SchedulerConfig::default(), None)
    }

    #[tokio::test]
    async fn create_task_rejects_bad_syntax() {
        let orch = orchestrator();
        let err = orch.create_task("alice", "2+").await.unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert!(orch.list_tasks("alice").await.is_empty());
    }

    #[tokio::test]
    async fn resubmission_creates_independent_tasks() {
        let orch = orchestrator();
        let first = orch.create_task("alice", "1+2").await.unwrap();
        let second = orch.create_task("alice", "1+2").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(orch.get_task(first.id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn other_owners_cannot_see_task() {
        let orch = orchestrator();
        let task = orch.create_task("alice", "1+2").await.unwrap();
        assert!(orch.get_task_for("alice", task.id).await.is_ok());
        assert!(matches!(
            orch.get_task_for("bob", task.id).await,
            Err(Error::Task(TaskError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn create_task_publishes_event() {
        let orch = orchestrator();
        let mut sub = orch.subscribe(EventFilter::for_owner("alice"));
        let task = orch.create_task("alice", "6*7").await.unwrap();
        match sub.recv().await {
            Some(crate::events::Delivery::Event(Event::TaskChanged(p))) => {
                assert_eq!(p.task_id, task.id);
                assert_eq!(p.status, TaskStatus::Pending);
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delay_update_is_persisted() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orch = Orchestrator::new(SchedulerConfig::default(), Some(Arc::clone(&store)));
        let update = HashMap::from([("plus".to_string(), 2)]);
        orch.update_delays(&update).await.unwrap();

        let stored = store.load_delays().await.unwrap();
        assert_eq!(
            stored[&crate::tasks::Operator::Add],
            std::time::Duration::from_secs(2)
        );
    }

    /// Store whose delay writes always fail.
    struct ReadOnlyDelays;

    #[async_trait::async_trait]
    impl Database for ReadOnlyDelays {
        async fn run_migrations(&self) -> std::result::Result<(), DatabaseError> {
            Ok(())
        }
        async fn insert_task(&self, _: &Task) -> std::result::Result<(), DatabaseError> {
            Ok(())
        }
        async fn update_task(&self, _: &Task) -> std::result::Result<(), DatabaseError> {
            Ok(())
        }
        async fn get_task(&self, _: TaskId) -> std::result::Result<Option<Task>, DatabaseError> {
            Ok(None)
        }
        async fn load_tasks(&self) -> std::result::Result<Vec<Task>, DatabaseError> {
            Ok(Vec::new())
        }
        async fn max_task_id(&self) -> std::result::Result<TaskId, DatabaseError> {
            Ok(0)
        }
        async fn load_delays(&self) -> std::result::Result<Delays, DatabaseError> {
            Ok(Delays::new())
        }
        async fn save_delays(&self, _: &Delays) -> std::result::Result<(), DatabaseError> {
            Err(DatabaseError::Query("disk is read-only".into()))
        }
    }

    #[tokio::test]
    async fn failed_delay_save_keeps_previous_delays() {
        let orch = Orchestrator::new(SchedulerConfig::default(), Some(Arc::new(ReadOnlyDelays)));
        let before = orch.delays().await;

        let update = HashMap::from([("plus".to_string(), 2), ("minus".to_string(), 0)]);
        let err = orch.update_delays(&update).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::Query(_))));
        assert_eq!(orch.delays().await, before);

        // Subtasks handed out afterwards still use the old delay.
        orch.create_task("alice", "1+2").await.unwrap();
        let assignment = orch.next_assignment("w1").await.unwrap();
        assert_eq!(
            u128::from(assignment.delay_ms),
            before[&crate::tasks::Operator::Add].as_millis()
        );
    }

    #[tokio::test]
    async fn recovery_resumes_unfinished_tasks() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let first = Orchestrator::new(SchedulerConfig::default(), Some(Arc::clone(&store)));
        first.recover().await.unwrap();
        let task = first.create_task("alice", "(1+2)*3").await.unwrap();
        let assignment = first.next_assignment("w1").await.unwrap();
        assert_eq!(assignment.task_id, task.id);
        first.create_task("alice", "5").await.unwrap();

        let second = Orchestrator::new(SchedulerConfig::default(), Some(Arc::clone(&store)));
        let stats = second.recover().await.unwrap();
        assert_eq!(stats, RecoveryStats { loaded: 2, resumed: 1 });

        let resumed = second.get_task(task.id).await.unwrap();
        assert!(resumed.subtasks[0].assigned_worker_id.is_none());

        let again = second.next_assignment("w2").await.unwrap();
        assert_eq!((again.task_id, again.subtask_id), (task.id, 0));
        assert_eq!(again.token, 2);

        let fresh = second.create_task("alice", "1+1").await.unwrap();
        assert!(fresh.id > task.id + 1);
    }
}
