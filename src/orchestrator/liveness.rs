//! Heartbeats and the unavailable-worker sweep.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Orchestrator, chrono_duration};
use crate::scheduler::ReadyEntry;
use crate::workers::directory::HeartbeatChange;
use crate::workers::model::{AssignmentRef, HeartbeatAck, ReportedStatus};

impl Orchestrator {
    /// Record a heartbeat. Registers unknown workers and brings unavailable
    /// or failed-over ones back to idle.
    pub async fn heartbeat(&self, worker_id: &str, reported: ReportedStatus) -> HeartbeatAck {
        self.heartbeat_at(worker_id, reported, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        worker_id: &str,
        reported: ReportedStatus,
        now: DateTime<Utc>,
    ) -> HeartbeatAck {
        let (record, change) = self.directory.heartbeat(worker_id, now).await;
        match change {
            HeartbeatChange::Registered => {
                info!(worker_id = %worker_id, "Worker registered");
                self.publish_worker(&record);
            }
            HeartbeatChange::Rejoined => {
                info!(worker_id = %worker_id, "Worker rejoined the idle pool");
                self.publish_worker(&record);
            }
            HeartbeatChange::Refreshed => {}
        }

        if reported == ReportedStatus::Busy && record.current.is_none() {
            debug!(worker_id = %worker_id, "Worker reports busy but holds no assignment");
        }

        HeartbeatAck {
            status: record.status,
            assignment: record.current,
        }
    }

    /// Mark workers silent for longer than the liveness threshold as
    /// unavailable and put their subtasks back in the ready queue.
    /// Returns the number of workers that lapsed.
    pub async fn sweep_liveness(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_duration(self.config.liveness_threshold);
        let lapsed = self.directory.mark_unavailable(cutoff).await;
        let count = lapsed.len();

        for worker in lapsed {
            warn!(
                worker_id = %worker.record.id,
                last_heartbeat = %worker.record.last_heartbeat,
                "Worker unavailable"
            );
            self.publish_worker(&worker.record);
            if let Some(held) = worker.held {
                self.reclaim(&worker.record.id, held, now).await;
            }
        }
        count
    }

    /// Return a lapsed worker's subtask to the ready queue if it still
    /// holds it.
    async fn reclaim(&self, worker_id: &str, held: AssignmentRef, now: DateTime<Utc>) {
        let Some(handle) = self.registry.handle(held.task_id).await else {
            return;
        };
        let mut task = handle.lock().await;
        if task
            .revoke_held(held.subtask_id, worker_id, held.token, now)
            .is_none()
        {
            return;
        }
        info!(
            task_id = task.id,
            subtask_id = held.subtask_id,
            worker_id = %worker_id,
            "Subtask released back to ready"
        );

        let entry = task
            .subtask(held.subtask_id)
            .and_then(|s| s.ready_seq)
            .map(|seq| ReadyEntry {
                seq,
                task_id: task.id,
                subtask_id: held.subtask_id,
            });
        self.persist(&task).await;
        if let Some(entry) = entry {
            self.queue.push(entry).await;
        }
        self.publish_task(&task);
    }
}
