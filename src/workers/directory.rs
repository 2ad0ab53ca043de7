//! Worker directory: registration, liveness and current assignment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::model::{AssignmentRef, WorkerRecord, WorkerStatus};

/// What a heartbeat changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatChange {
    Registered,
    /// Came back from `unavailable` or `failed_over`.
    Rejoined,
    Refreshed,
}

/// A worker that just went silent, with the assignment it was holding.
#[derive(Debug, Clone)]
pub struct Lapsed {
    pub record: WorkerRecord,
    pub held: Option<AssignmentRef>,
}

#[derive(Default)]
pub struct WorkerDirectory {
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a worker, registering it on first contact.
    pub async fn contact(&self, id: &str, now: DateTime<Utc>) -> (WorkerRecord, bool) {
        let mut workers = self.workers.write().await;
        match workers.get(id) {
            Some(record) => (record.clone(), false),
            None => {
                let record = WorkerRecord::new(id, now);
                workers.insert(id.to_string(), record.clone());
                (record, true)
            }
        }
    }

    pub async fn heartbeat(&self, id: &str, now: DateTime<Utc>) -> (WorkerRecord, HeartbeatChange) {
        let mut workers = self.workers.write().await;
        let Some(record) = workers.get_mut(id) else {
            let record = WorkerRecord::new(id, now);
            workers.insert(id.to_string(), record.clone());
            return (record, HeartbeatChange::Registered);
        };

        if now > record.last_heartbeat {
            record.last_heartbeat = now;
        }
        let change = match record.status {
            WorkerStatus::Unavailable | WorkerStatus::FailedOver => {
                record.status = WorkerStatus::Idle;
                record.current = None;
                record.expression = None;
                HeartbeatChange::Rejoined
            }
            WorkerStatus::Idle | WorkerStatus::Busy => HeartbeatChange::Refreshed,
        };
        (record.clone(), change)
    }

    /// Mark an idle worker busy with `assignment`.
    ///
    /// Fails with the worker's status when it cannot take work.
    pub async fn bind(
        &self,
        id: &str,
        assignment: AssignmentRef,
        expression: &str,
    ) -> Result<WorkerRecord, WorkerStatus> {
        let mut workers = self.workers.write().await;
        let Some(record) = workers.get_mut(id) else {
            return Err(WorkerStatus::Unavailable);
        };
        if record.status != WorkerStatus::Idle {
            return Err(record.status);
        }
        record.status = WorkerStatus::Busy;
        record.current = Some(assignment);
        record.expression = Some(expression.to_string());
        Ok(record.clone())
    }

    /// Return a worker to idle if it still holds `assignment`.
    pub async fn release(&self, id: &str, assignment: AssignmentRef) -> Option<WorkerRecord> {
        self.clear(id, assignment, WorkerStatus::Idle).await
    }

    /// Take `assignment` away after a timeout and hold the worker back until
    /// it heartbeats again.
    pub async fn fail_over(&self, id: &str, assignment: AssignmentRef) -> Option<WorkerRecord> {
        self.clear(id, assignment, WorkerStatus::FailedOver).await
    }

    async fn clear(
        &self,
        id: &str,
        assignment: AssignmentRef,
        status: WorkerStatus,
    ) -> Option<WorkerRecord> {
        let mut workers = self.workers.write().await;
        let record = workers.get_mut(id)?;
        if record.current != Some(assignment) {
            debug!(worker_id = %id, "Worker no longer holds assignment");
            return None;
        }
        record.current = None;
        record.expression = None;
        if record.status == WorkerStatus::Busy {
            record.status = status;
        }
        Some(record.clone())
    }

    /// Mark every worker silent since before `cutoff` unavailable.
    ///
    /// Each lapsed worker's assignment is handed back exactly once.
    pub async fn mark_unavailable(&self, cutoff: DateTime<Utc>) -> Vec<Lapsed> {
        let mut workers = self.workers.write().await;
        let mut lapsed = Vec::new();
        for record in workers.values_mut() {
            if record.status == WorkerStatus::Unavailable || record.last_heartbeat >= cutoff {
                continue;
            }
            record.status = WorkerStatus::Unavailable;
            record.expression = None;
            let held = record.current.take();
            lapsed.push(Lapsed {
                record: record.clone(),
                held,
            });
        }
        lapsed
    }

    pub async fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.workers.read().await.get(id).cloned()
    }

    /// All workers, sorted by id.
    pub async fn list(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self.workers.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}
