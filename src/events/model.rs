//! Event types and their push-channel encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::model::{SubtaskId, Task, TaskId, TaskStatus};
use crate::workers::model::{WorkerRecord, WorkerStatus};

pub const UPDATE_TASK: &str = "update task";
pub const UPDATE_WORKER: &str = "update worker";
pub const RESYNC: &str = "resync";

/// Task fields carried by a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub owner_id: String,
    pub status: TaskStatus,
    pub last_ping: DateTime<Utc>,
    pub result: Option<f64>,
    pub error: Option<String>,
}

impl From<&Task> for TaskPayload {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            status: task.status,
            last_ping: task.last_ping,
            result: task.result,
            error: task.error.clone(),
        }
    }
}

/// Worker fields carried by a change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub id: String,
    pub state: WorkerStatus,
    /// Operation the worker is executing, if any.
    pub exp: Option<String>,
    pub task_id: Option<TaskId>,
    pub subtask_id: Option<SubtaskId>,
}

impl From<&WorkerRecord> for WorkerPayload {
    fn from(record: &WorkerRecord) -> Self {
        Self {
            id: record.id.clone(),
            state: record.status,
            exp: record.expression.clone(),
            task_id: record.current.map(|c| c.task_id),
            subtask_id: record.current.map(|c| c.subtask_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TaskChanged(TaskPayload),
    WorkerChanged(WorkerPayload),
}

impl Event {
    pub fn task(task: &Task) -> Self {
        Self::TaskChanged(task.into())
    }

    pub fn worker(record: &WorkerRecord) -> Self {
        Self::WorkerChanged(record.into())
    }

    /// Encode for the push channel: `{type, message}` with the payload as a
    /// JSON string.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        let (kind, message) = match self {
            Self::TaskChanged(payload) => (UPDATE_TASK, serde_json::to_string(payload)?),
            Self::WorkerChanged(payload) => (UPDATE_WORKER, serde_json::to_string(payload)?),
        };
        Ok(Frame {
            kind: kind.to_string(),
            message,
        })
    }
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Event),
    /// The subscriber fell behind and `missed` events were dropped.
    Gap { missed: u64 },
}

/// Push-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl Frame {
    pub fn resync(missed: u64) -> Self {
        Self {
            kind: RESYNC.to_string(),
            message: missed.to_string(),
        }
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Only task events for this owner; all owners when `None`.
    pub owner_id: Option<String>,
    pub tasks: bool,
    pub workers: bool,
}

impl EventFilter {
    pub fn all() -> Self {
        Self {
            owner_id: None,
            tasks: true,
            workers: true,
        }
    }

    /// Own task events plus every worker event.
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            tasks: true,
            workers: true,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match event {
            Event::TaskChanged(payload) => {
                self.tasks
                    && self
                        .owner_id
                        .as_ref()
                        .is_none_or(|owner| *owner == payload.owner_id)
            }
            Event::WorkerChanged(_) => self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_event(owner: &str) -> Event {
        Event::TaskChanged(TaskPayload {
            task_id: 1,
            owner_id: owner.to_string(),
            status: TaskStatus::Processing,
            last_ping: Utc::now(),
            result: None,
            error: None,
        })
    }

    #[test]
    fn owner_filter_hides_other_tasks() {
        let filter = EventFilter::for_owner("alice");
        assert!(filter.matches(&task_event("alice")));
        assert!(!filter.matches(&task_event("bob")));
        assert!(EventFilter::all().matches(&task_event("bob")));
    }

    #[test]
    fn frame_embeds_payload_as_string() {
        let frame = task_event("alice").to_frame().unwrap();
        assert_eq!(frame.kind, UPDATE_TASK);
        let payload: serde_json::Value = serde_json::from_str(&frame.message).unwrap();
        assert_eq!(payload["taskId"], 1);
        assert_eq!(payload["status"], "processing");

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "update task");
    }

    #[test]
    fn worker_frame_uses_state_and_exp() {
        let event = Event::WorkerChanged(WorkerPayload {
            id: "w1".into(),
            state: WorkerStatus::Busy,
            exp: Some("2 + 3".into()),
            task_id: Some(4),
            subtask_id: Some(0),
        });
        let frame = event.to_frame().unwrap();
        assert_eq!(frame.kind, UPDATE_WORKER);
        let payload: serde_json::Value = serde_json::from_str(&frame.message).unwrap();
        assert_eq!(payload["state"], "busy");
        assert_eq!(payload["exp"], "2 + 3");
    }
}
