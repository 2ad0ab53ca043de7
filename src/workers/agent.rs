//! Worker agent: polls for assignments, simulates their cost, reports back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::OrchestratorClient;
use super::model::{Assignment, Outcome, ReportOutcome, ReportedStatus, ResultReport};
use crate::config::WorkerAgentConfig;

/// One executor. Run several for parallelism.
pub struct WorkerAgent {
    id: String,
    client: Arc<dyn OrchestratorClient>,
    heartbeat_interval: Duration,
    poll_backoff: Duration,
    busy: Arc<AtomicBool>,
}

impl WorkerAgent {
    pub fn new(
        id: impl Into<String>,
        client: Arc<dyn OrchestratorClient>,
        config: &WorkerAgentConfig,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            heartbeat_interval: config.heartbeat_interval,
            poll_backoff: config.poll_backoff,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Worker agent started");
        let heartbeat = self.spawn_heartbeat(shutdown.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.client.next_assignment(&self.id).await {
                Ok(Some(assignment)) => {
                    if !self.execute(assignment, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Ok(None) => self.backoff(),
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Polling for work failed");
                    self.backoff() * 4
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        heartbeat.abort();
        info!(worker_id = %self.id, "Worker agent stopped");
    }

    /// Sleep for the assignment's delay, evaluate, report. Returns `false`
    /// if shutdown interrupted the work.
    async fn execute(&self, assignment: Assignment, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.busy.store(true, Ordering::Relaxed);
        debug!(
            worker_id = %self.id,
            task_id = assignment.task_id,
            subtask_id = assignment.subtask_id,
            expression = %assignment.expression,
            "Executing assignment"
        );

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(assignment.delay_ms)) => false,
            _ = shutdown.changed() => true,
        };
        if interrupted {
            self.busy.store(false, Ordering::Relaxed);
            return false;
        }

        let outcome = match assignment.operator.apply(assignment.left, assignment.right) {
            Ok(value) => Outcome::Value { value },
            Err(e) => Outcome::Error {
                reason: e.to_string(),
            },
        };
        let report = ResultReport {
            task_id: assignment.task_id,
            subtask_id: assignment.subtask_id,
            worker_id: self.id.clone(),
            token: assignment.token,
            outcome,
        };

        match self.client.report(report).await {
            Ok(ReportOutcome::Accepted) => {}
            Ok(ReportOutcome::Rejected { reason }) => {
                debug!(worker_id = %self.id, reason = ?reason, "Result rejected");
            }
            Err(e) => warn!(worker_id = %self.id, error = %e, "Reporting result failed"),
        }
        self.busy.store(false, Ordering::Relaxed);
        true
    }

    /// Jittered poll delay (±25%).
    fn backoff(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        self.poll_backoff.mul_f64(factor)
    }

    fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let id = self.id.clone();
        let client = Arc::clone(&self.client);
        let busy = Arc::clone(&self.busy);
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let status = if busy.load(Ordering::Relaxed) {
                    ReportedStatus::Busy
                } else {
                    ReportedStatus::Idle
                };
                if let Err(e) = client.heartbeat(&id, status).await {
                    warn!(worker_id = %id, error = %e, "Heartbeat failed");
                }
            }
        })
    }
}

/// Start `count` agents named `{prefix}-1` .. `{prefix}-{count}`.
pub fn spawn_pool(
    client: Arc<dyn OrchestratorClient>,
    config: &WorkerAgentConfig,
    prefix: &str,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (1..=count)
        .map(|i| {
            let agent = WorkerAgent::new(format!("{prefix}-{i}"), Arc::clone(&client), config);
            tokio::spawn(agent.run(shutdown.clone()))
        })
        .collect()
}
