//! Task and subtask records plus the state transitions they go through.
//!
//! Everything here is plain data manipulated under the owning task's lock;
//! the orchestrator decides when to call each transition and what to
//! publish afterwards.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compiler::Dag;

pub type TaskId = u64;
pub type SubtaskId = u32;

/// Elementary binary operation.
///
/// Serialized with the operator names used by the delay API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "plus")]
    Add,
    #[serde(rename = "minus")]
    Subtract,
    #[serde(rename = "multiplication")]
    Multiply,
    #[serde(rename = "division")]
    Divide,
}

impl Operator {
    pub const ALL: [Operator; 4] = [
        Operator::Add,
        Operator::Subtract,
        Operator::Multiply,
        Operator::Divide,
    ];

    /// Wire name (`plus`, `minus`, `multiplication`, `division`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "plus",
            Self::Subtract => "minus",
            Self::Multiply => "multiplication",
            Self::Divide => "division",
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Subtract => '-',
            Self::Multiply => '*',
            Self::Divide => '/',
        }
    }

    /// Apply the operation with `f64` semantics.
    ///
    /// Division by zero and non-finite results are failures rather than
    /// infinities or NaN.
    pub fn apply(self, left: f64, right: f64) -> Result<f64, ArithmeticError> {
        let value = match self {
            Self::Add => left + right,
            Self::Subtract => left - right,
            Self::Multiply => left * right,
            Self::Divide => {
                if right == 0.0 {
                    return Err(ArithmeticError::DivisionByZero);
                }
                left / right
            }
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ArithmeticError::NonFinite)
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plus" => Ok(Self::Add),
            "minus" => Ok(Self::Subtract),
            "multiplication" => Ok(Self::Multiply),
            "division" => Ok(Self::Divide),
            other => Err(other.to_string()),
        }
    }
}

/// Failure evaluating a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArithmeticError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

/// Operand of a subtask: a literal or the result of another subtask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    Literal(f64),
    Subtask(SubtaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Blocked,
    Ready,
    Assigned,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(Self::Blocked),
            "ready" => Some(Self::Ready),
            "assigned" => Some(Self::Assigned),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One hand-out of a subtask to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub worker_id: String,
    pub token: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// One elementary operation in a task's DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub operator: Operator,
    pub left: Operand,
    pub right: Operand,
    pub status: SubtaskStatus,
    pub assigned_worker_id: Option<String>,
    /// Token of the latest assignment; 0 until first assigned.
    pub token: u32,
    /// Operator delay captured when the current assignment was made.
    pub delay: Option<Duration>,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<f64>,
    pub error: Option<String>,
    pub attempts: Vec<Attempt>,
    /// Position in the ready queue. Kept across revocations so a reclaimed
    /// subtask is handed out again before younger work.
    #[serde(skip)]
    pub ready_seq: Option<u64>,
}

impl Subtask {
    pub fn new(id: SubtaskId, operator: Operator, left: Operand, right: Operand) -> Self {
        Self {
            id,
            operator,
            left,
            right,
            status: SubtaskStatus::Blocked,
            assigned_worker_id: None,
            token: 0,
            delay: None,
            started_at: None,
            deadline: None,
            completed_at: None,
            result: None,
            error: None,
            attempts: Vec::new(),
            ready_seq: None,
        }
    }

    fn references(&self, id: SubtaskId) -> bool {
        self.left == Operand::Subtask(id) || self.right == Operand::Subtask(id)
    }
}

/// How a result report relates to the subtask's current assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    /// The reporter holds the live assignment.
    Current,
    /// The reporter's assignment was revoked but nobody has finished the
    /// subtask yet; the first result still wins.
    Late,
    /// The subtask already completed.
    Duplicate,
    /// The token was never issued to this worker, or the task is finished.
    Stale,
}

/// A live assignment cleared by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub worker_id: String,
    pub subtask_id: SubtaskId,
    pub token: u32,
}

/// Outcome of completing a subtask.
#[derive(Debug, Default)]
pub struct Completion {
    /// Subtasks whose operands are now all resolved.
    pub newly_ready: Vec<SubtaskId>,
    /// Whoever held the subtask when it completed.
    pub released: Option<Released>,
    pub task_completed: bool,
}

/// One submitted expression and its subtask arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: String,
    pub expression: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub result: Option<f64>,
    pub error: Option<String>,
    /// Literal for constant expressions, else the outermost subtask.
    pub root: Operand,
    /// Indexed by subtask id, in dependency discovery order.
    pub subtasks: Vec<Subtask>,
}

impl Task {
    /// Build a task from a compiled DAG. Nothing is ready until
    /// [`Task::promote_ready`] runs.
    pub fn new(
        id: TaskId,
        owner_id: impl Into<String>,
        expression: impl Into<String>,
        dag: Dag,
        now: DateTime<Utc>,
    ) -> Self {
        let root = dag.root();
        let subtasks = dag
            .into_nodes()
            .into_iter()
            .enumerate()
            .map(|(i, node)| Subtask::new(i as SubtaskId, node.operator, node.left, node.right))
            .collect();

        let mut task = Self {
            id,
            owner_id: owner_id.into(),
            expression: expression.into(),
            status: TaskStatus::Pending,
            created_at: now,
            last_ping: now,
            result: None,
            error: None,
            root,
            subtasks,
        };
        if let Operand::Literal(value) = root {
            task.status = TaskStatus::Completed;
            task.result = Some(value);
        }
        task
    }

    pub fn subtask(&self, id: SubtaskId) -> Option<&Subtask> {
        self.subtasks.get(id as usize)
    }

    fn subtask_mut(&mut self, id: SubtaskId) -> Option<&mut Subtask> {
        self.subtasks.get_mut(id as usize)
    }

    /// `lastPing` only moves forward.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_ping {
            self.last_ping = now;
        }
    }

    /// Resolved value of an operand, if available.
    pub fn operand_value(&self, operand: Operand) -> Option<f64> {
        match operand {
            Operand::Literal(value) => Some(value),
            Operand::Subtask(id) => self
                .subtask(id)
                .filter(|s| s.status == SubtaskStatus::Completed)
                .and_then(|s| s.result),
        }
    }

    /// Resolved operand values of a subtask.
    pub fn operands(&self, id: SubtaskId) -> Option<(f64, f64)> {
        let sub = self.subtask(id)?;
        Some((self.operand_value(sub.left)?, self.operand_value(sub.right)?))
    }

    /// Move every blocked subtask with resolved operands to `ready`.
    pub fn promote_ready(&mut self) -> Vec<SubtaskId> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        let promoted: Vec<SubtaskId> = self
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Blocked)
            .filter(|s| self.operand_value(s.left).is_some() && self.operand_value(s.right).is_some())
            .map(|s| s.id)
            .collect();
        for id in &promoted {
            self.subtasks[*id as usize].status = SubtaskStatus::Ready;
        }
        promoted
    }

    /// Whether a queue entry for `id` stamped with `seq` is still live.
    pub fn is_dispatchable(&self, id: SubtaskId, seq: u64) -> bool {
        !self.status.is_terminal()
            && self
                .subtask(id)
                .is_some_and(|s| s.status == SubtaskStatus::Ready && s.ready_seq == Some(seq))
    }

    /// Hand a ready subtask to `worker_id`. Returns the new token.
    pub fn assign(
        &mut self,
        id: SubtaskId,
        worker_id: &str,
        delay: Duration,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Option<u32> {
        let sub = self.subtask_mut(id)?;
        if sub.status != SubtaskStatus::Ready {
            return None;
        }
        sub.status = SubtaskStatus::Assigned;
        sub.token += 1;
        sub.assigned_worker_id = Some(worker_id.to_string());
        sub.delay = Some(delay);
        sub.started_at = Some(now);
        sub.deadline = Some(deadline);
        sub.attempts.push(Attempt {
            worker_id: worker_id.to_string(),
            token: sub.token,
            started_at: now,
            deadline,
            revoked_at: None,
        });
        let token = sub.token;

        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Processing;
        }
        self.touch(now);
        Some(token)
    }

    /// Assigned subtasks whose deadline has passed.
    pub fn expired_assignments(&self, now: DateTime<Utc>) -> Vec<SubtaskId> {
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Assigned)
            .filter(|s| s.deadline.is_some_and(|d| d <= now))
            .map(|s| s.id)
            .collect()
    }

    /// Return an assigned subtask to `ready`. No-op unless it is assigned.
    pub fn revoke(&mut self, id: SubtaskId, now: DateTime<Utc>) -> Option<Released> {
        let sub = self.subtask_mut(id)?;
        if sub.status != SubtaskStatus::Assigned {
            return None;
        }
        let worker_id = sub.assigned_worker_id.take()?;
        sub.status = SubtaskStatus::Ready;
        sub.deadline = None;
        let token = sub.token;
        if let Some(attempt) = sub.attempts.iter_mut().find(|a| a.token == token) {
            attempt.revoked_at = Some(now);
        }
        Some(Released {
            worker_id,
            subtask_id: id,
            token,
        })
    }

    /// Revoke only if `worker_id` still holds assignment `token`.
    pub fn revoke_held(
        &mut self,
        id: SubtaskId,
        worker_id: &str,
        token: u32,
        now: DateTime<Utc>,
    ) -> Option<Released> {
        let sub = self.subtask(id)?;
        if sub.status != SubtaskStatus::Assigned
            || sub.token != token
            || sub.assigned_worker_id.as_deref() != Some(worker_id)
        {
            return None;
        }
        self.revoke(id, now)
    }

    /// Classify a result report from `worker_id` carrying `token`.
    pub fn acceptance(&self, id: SubtaskId, worker_id: &str, token: u32) -> Acceptance {
        let Some(sub) = self.subtask(id) else {
            return Acceptance::Stale;
        };
        if sub.status == SubtaskStatus::Completed {
            return Acceptance::Duplicate;
        }
        if self.status.is_terminal() || sub.status == SubtaskStatus::Failed {
            return Acceptance::Stale;
        }
        if sub.status == SubtaskStatus::Assigned
            && sub.token == token
            && sub.assigned_worker_id.as_deref() == Some(worker_id)
        {
            return Acceptance::Current;
        }
        let issued = sub
            .attempts
            .iter()
            .any(|a| a.token == token && a.worker_id == worker_id && a.revoked_at.is_some());
        if issued {
            Acceptance::Late
        } else {
            Acceptance::Stale
        }
    }

    /// Record a subtask's value and propagate readiness.
    pub fn complete(&mut self, id: SubtaskId, value: f64, now: DateTime<Utc>) -> Completion {
        let mut completion = Completion::default();
        let Some(sub) = self.subtask_mut(id) else {
            return completion;
        };
        if sub.status.is_terminal() {
            return completion;
        }
        if let Some(worker_id) = sub.assigned_worker_id.take() {
            completion.released = Some(Released {
                worker_id,
                subtask_id: id,
                token: sub.token,
            });
        }
        sub.status = SubtaskStatus::Completed;
        sub.result = Some(value);
        sub.completed_at = Some(now);
        sub.deadline = None;
        self.touch(now);

        if self.root == Operand::Subtask(id) {
            self.status = TaskStatus::Completed;
            self.result = Some(value);
            completion.task_completed = true;
        } else {
            completion.newly_ready = self.promote_ready();
        }
        completion
    }

    /// Fail `id`, everything depending on it, and the task.
    ///
    /// Subtasks outside the failed branch are failed as well since their
    /// results can no longer contribute. Returns every live assignment
    /// that was cleared.
    pub fn fail(&mut self, id: SubtaskId, reason: &str, now: DateTime<Utc>) -> Vec<Released> {
        let mut released = Vec::new();
        if self.subtask(id).is_none() || self.status.is_terminal() {
            return released;
        }

        let mut descendants = vec![false; self.subtasks.len()];
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for sub in &self.subtasks {
                if sub.references(current) && !descendants[sub.id as usize] {
                    descendants[sub.id as usize] = true;
                    stack.push(sub.id);
                }
            }
        }

        for sub in &mut self.subtasks {
            if sub.status.is_terminal() {
                continue;
            }
            if let Some(worker_id) = sub.assigned_worker_id.take() {
                released.push(Released {
                    worker_id,
                    subtask_id: sub.id,
                    token: sub.token,
                });
            }
            sub.error = Some(if sub.id == id {
                reason.to_string()
            } else if descendants[sub.id as usize] {
                format!("depends on failed subtask #{id}")
            } else {
                "task failed".to_string()
            });
            sub.status = SubtaskStatus::Failed;
            sub.completed_at = Some(now);
            sub.deadline = None;
        }

        self.status = TaskStatus::Failed;
        self.error = Some(reason.to_string());
        self.touch(now);
        released
    }

    /// Prepare an unfinished task loaded from storage for scheduling again.
    ///
    /// Assignments held before the restart are revoked. Returns every
    /// subtask that is ready afterwards.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Vec<SubtaskId> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        let assigned: Vec<SubtaskId> = self
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Assigned)
            .map(|s| s.id)
            .collect();
        for id in assigned {
            self.revoke(id, now);
        }
        self.promote_ready();
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Ready)
            .map(|s| s.id)
            .collect()
    }

    /// Render a subtask as `left op right`, with unresolved references as `#id`.
    pub fn render(&self, id: SubtaskId) -> String {
        let Some(sub) = self.subtask(id) else {
            return String::new();
        };
        format!(
            "{} {} {}",
            self.render_operand(sub.left),
            sub.operator.symbol(),
            self.render_operand(sub.right)
        )
    }

    fn render_operand(&self, operand: Operand) -> String {
        match (operand, self.operand_value(operand)) {
            (_, Some(value)) => format_number(value),
            (Operand::Subtask(id), None) => format!("#{id}"),
            (Operand::Literal(value), None) => format_number(value),
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            expression: self.expression.clone(),
            status: self.status,
            created: self.created_at,
            last_ping: self.last_ping,
            result: self.result,
            error: self.error.clone(),
        }
    }

    pub fn detail(&self) -> TaskDetail {
        TaskDetail {
            summary: self.summary(),
            subtasks: self
                .subtasks
                .iter()
                .map(|s| SubtaskView {
                    id: s.id,
                    value: self.render(s.id),
                    status: s.status,
                    result: s.result,
                    time: s.completed_at.or(s.started_at),
                    worker: s.assigned_worker_id.clone(),
                    error: s.error.clone(),
                })
                .collect(),
        }
    }
}

/// Numbers print without a trailing `.0` for integral values.
pub fn format_number(value: f64) -> String {
    format!("{value}")
}

/// Task as shown in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub expression: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub result: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskView {
    pub id: SubtaskId,
    pub value: String,
    pub status: SubtaskStatus,
    pub result: Option<f64>,
    pub time: Option<DateTime<Utc>>,
    pub worker: Option<String>,
    pub error: Option<String>,
}

/// Task with its subtasks, for the detail view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub summary: TaskSummary,
    pub subtasks: Vec<SubtaskView>,
}
