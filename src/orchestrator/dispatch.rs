//! Handing ready subtasks to workers and reclaiming expired assignments.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Orchestrator, chrono_duration};
use crate::error::TaskError;
use crate::scheduler::ReadyEntry;
use crate::tasks::SubtaskStatus;
use crate::workers::model::{Assignment, AssignmentRef, WorkerStatus};

impl Orchestrator {
    /// Give `worker_id` the oldest ready subtask, if any. Never blocks on
    /// workers.
    ///
    /// A busy worker gets its current assignment again. A worker that was
    /// failed over or went unavailable gets nothing until it heartbeats.
    pub async fn next_assignment(&self, worker_id: &str) -> Option<Assignment> {
        let now = Utc::now();
        let (record, registered) = self.directory.contact(worker_id, now).await;
        if registered {
            debug!(worker_id = %worker_id, "Worker registered on first poll");
            self.publish_worker(&record);
        }

        match record.status {
            WorkerStatus::Idle => {}
            WorkerStatus::Busy => {
                let current = record.current?;
                return self.redeliver(worker_id, current).await;
            }
            WorkerStatus::FailedOver | WorkerStatus::Unavailable => {
                debug!(worker_id = %worker_id, status = ?record.status, "Worker must heartbeat before polling");
                return None;
            }
        }

        while let Some(entry) = self.queue.pop().await {
            let Some(handle) = self.registry.handle(entry.task_id).await else {
                continue;
            };
            let mut task = handle.lock().await;
            if !task.is_dispatchable(entry.subtask_id, entry.seq) {
                continue;
            }

            let sid = entry.subtask_id;
            let Some(sub) = task.subtask(sid) else {
                continue;
            };
            let operator = sub.operator;
            let token = sub.token + 1;
            let Some((left, right)) = task.operands(sid) else {
                continue;
            };

            // Snapshot of the delay; later policy changes leave this assignment alone.
            let delay = self.delays.get(operator).await;
            let deadline = now + chrono_duration(self.config.assignment_timeout(delay));
            let expression = task.render(sid);
            let reference = AssignmentRef {
                task_id: task.id,
                subtask_id: sid,
                token,
            };

            let record = match self.directory.bind(worker_id, reference, &expression).await {
                Ok(record) => record,
                Err(status) => {
                    debug!(worker_id = %worker_id, status = ?status, "Worker cannot take work, requeueing");
                    self.queue.push(entry).await;
                    return None;
                }
            };

            if task.assign(sid, worker_id, delay, now, deadline) != Some(token) {
                // Unreachable while the task lock is held; undo the binding.
                self.queue.push(entry).await;
                self.release_worker(worker_id, reference).await;
                return None;
            }

            debug!(
                task_id = task.id,
                subtask_id = sid,
                worker_id = %worker_id,
                token,
                deadline = %deadline,
                "Subtask assigned"
            );

            self.persist(&task).await;
            self.publish_task(&task);
            self.publish_worker(&record);

            return Some(Assignment {
                task_id: task.id,
                subtask_id: sid,
                token,
                operator,
                left,
                right,
                delay_ms: delay.as_millis() as u64,
                deadline,
                expression,
            });
        }

        None
    }

    /// Rebuild the assignment a busy worker already holds.
    async fn redeliver(&self, worker_id: &str, current: AssignmentRef) -> Option<Assignment> {
        let handle = self.registry.handle(current.task_id).await?;
        let task = handle.lock().await;
        let sub = task.subtask(current.subtask_id)?;

        let holds = sub.status == SubtaskStatus::Assigned
            && sub.token == current.token
            && sub.assigned_worker_id.as_deref() == Some(worker_id);
        let operands = task.operands(current.subtask_id);
        let (Some((left, right)), Some(deadline), true) = (operands, sub.deadline, holds) else {
            drop(task);
            self.release_worker(worker_id, current).await;
            return None;
        };

        debug!(worker_id = %worker_id, task_id = current.task_id, subtask_id = current.subtask_id, "Redelivering assignment");
        Some(Assignment {
            task_id: current.task_id,
            subtask_id: current.subtask_id,
            token: current.token,
            operator: sub.operator,
            left,
            right,
            delay_ms: sub.delay.map_or(0, |d| d.as_millis() as u64),
            deadline,
            expression: task.render(current.subtask_id),
        })
    }

    /// Revoke every assignment whose deadline is at or before `now`.
    ///
    /// The subtask goes back to the front of the ready queue and the worker
    /// is failed over. Returns the number of revocations.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        let mut revoked = 0;
        for handle in self.registry.active_handles().await {
            let mut task = handle.lock().await;
            let expired = task.expired_assignments(now);
            if expired.is_empty() {
                continue;
            }

            let mut entries = Vec::new();
            let mut failed_over = Vec::new();
            for sid in expired {
                let timeout = task
                    .subtask(sid)
                    .and_then(|s| Some((s.deadline? - s.started_at?).to_std().unwrap_or_default()))
                    .unwrap_or_default();
                let Some(released) = task.revoke(sid, now) else {
                    continue;
                };
                let err = TaskError::WorkerTimeout {
                    worker_id: released.worker_id.clone(),
                    timeout,
                };
                warn!(task_id = task.id, subtask_id = sid, error = %err, "Assignment revoked");

                if let Some(seq) = task.subtask(sid).and_then(|s| s.ready_seq) {
                    entries.push(ReadyEntry {
                        seq,
                        task_id: task.id,
                        subtask_id: sid,
                    });
                }
                failed_over.push((
                    released.worker_id,
                    AssignmentRef {
                        task_id: task.id,
                        subtask_id: sid,
                        token: released.token,
                    },
                ));
                revoked += 1;
            }

            self.persist(&task).await;
            self.queue.push_all(entries).await;
            for (worker_id, reference) in failed_over {
                if let Some(record) = self.directory.fail_over(&worker_id, reference).await {
                    self.publish_worker(&record);
                }
            }
            self.publish_task(&task);
        }
        revoked
    }
}
