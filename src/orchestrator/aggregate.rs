//! Result aggregation: accepting reports and propagating values.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::{Result, TaskError};
use crate::tasks::model::ArithmeticError;
use crate::tasks::{Acceptance, Operator, SubtaskId, Task};
use crate::workers::model::{AssignmentRef, Outcome, RejectReason, ReportOutcome, ResultReport};

impl Orchestrator {
    /// Apply a worker's result for one subtask.
    ///
    /// The first valid report wins: the current holder, or a worker whose
    /// assignment was revoked but whose result arrives before anyone else
    /// finishes. Everything else is rejected without touching state.
    pub async fn report_result(&self, report: ResultReport) -> Result<ReportOutcome> {
        let now = Utc::now();
        let reference = AssignmentRef {
            task_id: report.task_id,
            subtask_id: report.subtask_id,
            token: report.token,
        };

        let handle = self
            .registry
            .handle(report.task_id)
            .await
            .ok_or(TaskError::NotFound { id: report.task_id })?;
        let mut task = handle.lock().await;
        let sid = report.subtask_id;
        let Some(sub) = task.subtask(sid) else {
            return Err(TaskError::SubtaskNotFound {
                task_id: report.task_id,
                subtask_id: sid,
            }
            .into());
        };
        let operator = sub.operator;

        let acceptance = task.acceptance(sid, &report.worker_id, report.token);
        let reason = match acceptance {
            Acceptance::Current | Acceptance::Late => None,
            Acceptance::Duplicate => Some(RejectReason::Duplicate),
            Acceptance::Stale => Some(RejectReason::Stale),
        };
        if let Some(reason) = reason {
            let err = TaskError::StaleAssignment {
                task_id: report.task_id,
                subtask_id: sid,
                worker_id: report.worker_id.clone(),
            };
            debug!(error = %err, reason = ?reason, "Discarding result report");
            drop(task);
            self.release_worker(&report.worker_id, reference).await;
            return Ok(ReportOutcome::Rejected { reason });
        }
        if acceptance == Acceptance::Late {
            info!(
                task_id = report.task_id,
                subtask_id = sid,
                worker_id = %report.worker_id,
                "Accepting late result from revoked assignment"
            );
        }

        let value = match report.outcome {
            Outcome::Value { value } => check_value(&task, sid, operator, value),
            Outcome::Error { reason } => Err(reason),
        };

        match value {
            Ok(value) => {
                let completion = task.complete(sid, value, now);
                let entries = self.queue.stamp(&mut task, &completion.newly_ready);
                debug!(
                    task_id = task.id,
                    subtask_id = sid,
                    value,
                    newly_ready = entries.len(),
                    "Subtask completed"
                );

                self.persist(&task).await;
                self.queue.push_all(entries).await;
                if completion.task_completed {
                    info!(task_id = task.id, result = value, "Task completed");
                    self.registry.mark_finished(task.id).await;
                }
                if let Some(released) = completion.released {
                    self.release_worker(
                        &released.worker_id,
                        AssignmentRef {
                            task_id: task.id,
                            subtask_id: sid,
                            token: released.token,
                        },
                    )
                    .await;
                }
                self.release_worker(&report.worker_id, reference).await;
            }
            Err(reason) => {
                let err = TaskError::ArithmeticFailure {
                    task_id: task.id,
                    reason: reason.clone(),
                };
                warn!(subtask_id = sid, error = %err, "Task failed");

                let released = task.fail(sid, &reason, now);
                self.persist(&task).await;
                self.registry.mark_finished(task.id).await;
                for r in released {
                    self.release_worker(
                        &r.worker_id,
                        AssignmentRef {
                            task_id: task.id,
                            subtask_id: r.subtask_id,
                            token: r.token,
                        },
                    )
                    .await;
                }
                self.release_worker(&report.worker_id, reference).await;
            }
        }

        self.publish_task(&task);
        Ok(ReportOutcome::Accepted)
    }
}

/// Reject values the operation could not have produced: any result of a
/// division by zero and non-finite numbers.
fn check_value(
    task: &Task,
    sid: SubtaskId,
    operator: Operator,
    value: f64,
) -> std::result::Result<f64, String> {
    let divides_by_zero = operator == Operator::Divide
        && task.operands(sid).is_some_and(|(_, right)| right == 0.0);
    if divides_by_zero {
        return Err(ArithmeticError::DivisionByZero.to_string());
    }
    if !value.is_finite() {
        return Err(ArithmeticError::NonFinite.to_string());
    }
    Ok(value)
}
