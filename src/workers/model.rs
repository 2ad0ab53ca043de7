//! Worker records and the messages exchanged with workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::model::{Operator, SubtaskId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// An assignment timed out; the worker gets nothing until it heartbeats.
    FailedOver,
    /// Heartbeats stopped arriving.
    Unavailable,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::FailedOver => "failed_over",
            Self::Unavailable => "unavailable",
        }
    }
}

/// What a worker says about itself in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    #[default]
    Idle,
    Busy,
}

/// Identifies one hand-out of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRef {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    pub current: Option<AssignmentRef>,
    /// Rendered operation of the current assignment.
    pub expression: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Idle,
            current: None,
            expression: None,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id.clone(),
            status: self.status,
            expression: self.expression.clone(),
            task_id: self.current.map(|c| c.task_id),
            subtask_id: self.current.map(|c| c.subtask_id),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Worker as shown by `/getWorkersInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub id: String,
    pub status: WorkerStatus,
    pub expression: Option<String>,
    pub task_id: Option<TaskId>,
    pub subtask_id: Option<SubtaskId>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub token: u32,
    pub operator: Operator,
    pub left: f64,
    pub right: f64,
    /// Simulated execution time.
    pub delay_ms: u64,
    pub deadline: DateTime<Utc>,
    pub expression: String,
}

impl Assignment {
    pub fn reference(&self) -> AssignmentRef {
        AssignmentRef {
            task_id: self.task_id,
            subtask_id: self.subtask_id,
            token: self.token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: ReportedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub status: WorkerStatus,
    pub assignment: Option<AssignmentRef>,
}

/// Result of executing an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Value { value: f64 },
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub worker_id: String,
    pub token: u32,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The subtask already has a result.
    Duplicate,
    /// The reporter does not hold (and never held) this assignment.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    Accepted,
    Rejected { reason: RejectReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_report_wire_shape() {
        let report = ResultReport {
            task_id: 3,
            subtask_id: 1,
            worker_id: "w1".into(),
            token: 2,
            outcome: Outcome::Value { value: 5.0 },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["taskId"], 3);
        assert_eq!(json["outcome"], "value");
        assert_eq!(json["value"], 5.0);

        let back: ResultReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn rejected_outcome_wire_shape() {
        let json = serde_json::to_value(ReportOutcome::Rejected {
            reason: RejectReason::Duplicate,
        })
        .unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "duplicate");
    }

    #[test]
    fn heartbeat_status_defaults_to_idle() {
        let req: HeartbeatRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.status, ReportedStatus::Idle);
    }
}
