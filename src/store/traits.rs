//! `Database` trait: the async persistence interface for tasks and delays.

use async_trait::async_trait;

use crate::delay::Delays;
use crate::error::DatabaseError;
use crate::tasks::model::{Task, TaskId};

/// Backend-agnostic storage for the task registry and delay policy.
///
/// The in-memory registry is authoritative while the process runs; the
/// database lets it survive a restart.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task and all of its subtasks atomically.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Write back a task's mutable fields and every subtask.
    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, DatabaseError>;

    /// Every stored task, oldest first.
    async fn load_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Highest stored task id, 0 when empty.
    async fn max_task_id(&self) -> Result<TaskId, DatabaseError>;

    // ── Delays ──────────────────────────────────────────────────────

    /// Stored delays; empty if never saved.
    async fn load_delays(&self) -> Result<Delays, DatabaseError>;

    async fn save_delays(&self, delays: &Delays) -> Result<(), DatabaseError>;
}
