//! End-to-end scheduling scenarios driven straight through the orchestrator,
//! with workers played by the test and explicit clocks for the sweeps.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use calc_orchestrator::config::SchedulerConfig;
use calc_orchestrator::orchestrator::Orchestrator;
use calc_orchestrator::tasks::{SubtaskStatus, TaskStatus};
use calc_orchestrator::workers::model::RejectReason;
use calc_orchestrator::workers::{
    Assignment, Outcome, ReportOutcome, ReportedStatus, ResultReport, WorkerStatus,
};

fn orchestrator() -> Arc<Orchestrator> {
    Orchestrator::new(SchedulerConfig::default(), None)
}

fn value_of(assignment: &Assignment) -> f64 {
    assignment
        .operator
        .apply(assignment.left, assignment.right)
        .unwrap_or(f64::NAN)
}

async fn report(
    orch: &Orchestrator,
    worker: &str,
    assignment: &Assignment,
    outcome: Outcome,
) -> ReportOutcome {
    orch.report_result(ResultReport {
        task_id: assignment.task_id,
        subtask_id: assignment.subtask_id,
        worker_id: worker.to_string(),
        token: assignment.token,
        outcome,
    })
    .await
    .unwrap()
}

/// Take and finish one assignment; returns it.
async fn run_one(orch: &Orchestrator, worker: &str) -> Assignment {
    let assignment = orch.next_assignment(worker).await.expect("work available");
    let value = value_of(&assignment);
    assert_eq!(
        report(orch, worker, &assignment, Outcome::Value { value }).await,
        ReportOutcome::Accepted
    );
    assignment
}

async fn status(orch: &Orchestrator, worker: &str) -> WorkerStatus {
    orch.worker(worker).await.expect("known worker").status
}

#[tokio::test]
async fn division_by_zero_fails_task() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "10/0+5").await.unwrap();

    let assignment = orch.next_assignment("w1").await.unwrap();
    assert_eq!(assignment.expression, "10 / 0");
    let outcome = Outcome::Error {
        reason: "division by zero".into(),
    };
    assert_eq!(
        report(&orch, "w1", &assignment, outcome).await,
        ReportOutcome::Accepted
    );

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.result, None);
    assert_eq!(task.error.as_deref(), Some("division by zero"));
    assert!(task.subtasks.iter().all(|s| s.status == SubtaskStatus::Failed));
    assert_eq!(status(&orch, "w1").await, WorkerStatus::Idle);
    assert!(orch.next_assignment("w1").await.is_none());
}

#[tokio::test]
async fn infinite_value_for_zero_divisor_fails_task() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "1/0").await.unwrap();

    let assignment = orch.next_assignment("w1").await.unwrap();
    let outcome = Outcome::Value {
        value: f64::INFINITY,
    };
    report(&orch, "w1", &assignment, outcome).await;

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("division by zero"));
}

#[tokio::test]
async fn single_worker_computes_product_of_sum() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "(2+3)*4").await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let first = run_one(&orch, "w1").await;
    assert_eq!(first.expression, "2 + 3");
    let second = run_one(&orch, "w1").await;
    assert_eq!(second.expression, "5 * 4");

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(20.0));
    assert!(orch.next_assignment("w1").await.is_none());
}

#[tokio::test]
async fn two_workers_share_an_additive_chain() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "1+2+3+4").await.unwrap();
    assert_eq!(task.subtasks.len(), 3);

    let a = orch.next_assignment("w1").await.unwrap();
    let b = orch.next_assignment("w2").await.unwrap();
    assert_ne!(a.subtask_id, b.subtask_id);
    assert_eq!(status(&orch, "w1").await, WorkerStatus::Busy);
    assert_eq!(status(&orch, "w2").await, WorkerStatus::Busy);

    // The root waits on both halves.
    assert!(orch.next_assignment("w3").await.is_none());

    report(&orch, "w2", &b, Outcome::Value { value: value_of(&b) }).await;
    report(&orch, "w1", &a, Outcome::Value { value: value_of(&a) }).await;

    let root = run_one(&orch, "w2").await;
    assert_eq!(root.expression, "3 + 7");

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(10.0));
}

#[tokio::test]
async fn delay_change_keeps_existing_deadline() {
    let orch = orchestrator();
    let update: HashMap<String, i64> = [("multiplication".to_string(), 5)].into();
    orch.update_delays(&update).await.unwrap();

    let first = orch.create_task("alice", "2*3").await.unwrap();
    let assignment = orch.next_assignment("w1").await.unwrap();
    assert_eq!(assignment.delay_ms, 5_000);

    let before = orch.get_task(first.id).await.unwrap();
    let sub = &before.subtasks[0];
    let window = sub.deadline.unwrap() - sub.started_at.unwrap();
    assert_eq!(window, ChronoDuration::seconds(15));

    let update: HashMap<String, i64> = [("multiplication".to_string(), 1)].into();
    orch.update_delays(&update).await.unwrap();

    let after = orch.get_task(first.id).await.unwrap();
    let sub = &after.subtasks[0];
    assert_eq!(sub.deadline.unwrap() - sub.started_at.unwrap(), window);
    assert_eq!(sub.delay, Some(std::time::Duration::from_secs(5)));

    // Past the would-be new deadline but inside the original one.
    let check_at = sub.started_at.unwrap() + ChronoDuration::seconds(10);
    assert_eq!(orch.sweep_timeouts(check_at).await, 0);

    // New assignments pick up the new delay.
    orch.create_task("alice", "4*5").await.unwrap();
    let next = orch.next_assignment("w2").await.unwrap();
    assert_eq!(next.delay_ms, 1_000);
}

#[tokio::test]
async fn silent_worker_loses_its_subtask() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "2+3").await.unwrap();

    let now = Utc::now();
    orch.heartbeat_at("w1", ReportedStatus::Idle, now).await;
    let lost = orch.next_assignment("w1").await.unwrap();

    let later = now + ChronoDuration::seconds(11);
    orch.heartbeat_at("w2", ReportedStatus::Idle, later).await;
    assert_eq!(orch.sweep_liveness(later).await, 1);
    assert_eq!(status(&orch, "w1").await, WorkerStatus::Unavailable);

    let current = orch.get_task(task.id).await.unwrap();
    assert_eq!(current.subtasks[0].status, SubtaskStatus::Ready);

    let retry = orch.next_assignment("w2").await.unwrap();
    assert_eq!(retry.subtask_id, lost.subtask_id);
    assert_eq!(retry.token, lost.token + 1);
    report(&orch, "w2", &retry, Outcome::Value { value: 5.0 }).await;

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(5.0));

    // The unavailable worker comes back by heartbeating.
    let ack = orch.heartbeat("w1", ReportedStatus::Idle).await;
    assert_eq!(ack.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn timed_out_assignment_is_reassigned() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "6/2").await.unwrap();

    let slow = orch.next_assignment("w1").await.unwrap();
    assert_eq!(orch.sweep_timeouts(slow.deadline).await, 1);
    assert_eq!(status(&orch, "w1").await, WorkerStatus::FailedOver);
    assert!(orch.next_assignment("w1").await.is_none());

    let fresh = orch.next_assignment("w2").await.unwrap();
    assert_eq!(fresh.subtask_id, slow.subtask_id);
    assert_eq!(fresh.token, slow.token + 1);

    // The revoked worker's result still lands first.
    assert_eq!(
        report(&orch, "w1", &slow, Outcome::Value { value: 3.0 }).await,
        ReportOutcome::Accepted
    );
    assert_eq!(
        report(&orch, "w2", &fresh, Outcome::Value { value: 3.0 }).await,
        ReportOutcome::Rejected {
            reason: RejectReason::Duplicate
        }
    );
    assert_eq!(status(&orch, "w2").await, WorkerStatus::Idle);

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(3.0));

    let ack = orch.heartbeat("w1", ReportedStatus::Idle).await;
    assert_eq!(ack.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn duplicate_report_is_rejected() {
    let orch = orchestrator();
    let task = orch.create_task("alice", "2*3+1").await.unwrap();

    let assignment = run_one(&orch, "w1").await;
    let again = report(&orch, "w1", &assignment, Outcome::Value { value: 99.0 }).await;
    assert_eq!(
        again,
        ReportOutcome::Rejected {
            reason: RejectReason::Duplicate
        }
    );

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.subtasks[0].result, Some(6.0));
    assert_eq!(task.subtasks[0].status, SubtaskStatus::Completed);
}

#[tokio::test]
async fn stranger_report_is_stale() {
    let orch = orchestrator();
    orch.create_task("alice", "2*3").await.unwrap();
    let assignment = orch.next_assignment("w1").await.unwrap();

    let outcome = report(&orch, "intruder", &assignment, Outcome::Value { value: 6.0 }).await;
    assert_eq!(
        outcome,
        ReportOutcome::Rejected {
            reason: RejectReason::Stale
        }
    );
    assert_eq!(status(&orch, "w1").await, WorkerStatus::Busy);
}

#[tokio::test]
async fn resubmission_creates_independent_task() {
    let orch = orchestrator();
    let first = orch.create_task("alice", "2+2").await.unwrap();
    let second = orch.create_task("alice", "2+2").await.unwrap();
    assert_ne!(first.id, second.id);

    let assignment = run_one(&orch, "w1").await;
    assert_eq!(assignment.task_id, first.id);

    let first = orch.get_task(first.id).await.unwrap();
    let second = orch.get_task(second.id).await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(second.status, TaskStatus::Pending);
    assert_eq!(second.subtasks[0].status, SubtaskStatus::Ready);
}

#[tokio::test]
async fn busy_worker_repoll_gets_same_assignment() {
    let orch = orchestrator();
    orch.create_task("alice", "1+1").await.unwrap();
    orch.create_task("alice", "2+2").await.unwrap();

    let first = orch.next_assignment("w1").await.unwrap();
    let again = orch.next_assignment("w1").await.unwrap();
    assert_eq!(again.task_id, first.task_id);
    assert_eq!(again.token, first.token);
}
