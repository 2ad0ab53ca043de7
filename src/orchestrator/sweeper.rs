//! Background sweep for assignment timeouts and worker liveness.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Orchestrator;

/// Run both sweeps every `sweep_interval` until the handle is aborted.
pub fn spawn_sweeper(orchestrator: Arc<Orchestrator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(orchestrator.config().sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = Utc::now();
            let revoked = orchestrator.sweep_timeouts(now).await;
            let lapsed = orchestrator.sweep_liveness(now).await;
            if revoked > 0 || lapsed > 0 {
                debug!(revoked, lapsed, "Sweep finished");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::SchedulerConfig;
    use crate::tasks::SubtaskStatus;
    use crate::workers::model::WorkerStatus;

    #[tokio::test]
    async fn sweeper_reclaims_expired_assignment() {
        let config = SchedulerConfig {
            min_assignment_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let orch = Orchestrator::new(config, None);
        let update = std::collections::HashMap::from([("plus".to_string(), 0)]);
        orch.update_delays(&update).await.unwrap();

        let task = orch.create_task("alice", "1+2").await.unwrap();
        orch.heartbeat("w1", Default::default()).await;
        orch.next_assignment("w1").await.unwrap();

        let handle = spawn_sweeper(Arc::clone(&orch));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let task = orch.get_task(task.id).await.unwrap();
        assert_eq!(task.subtasks[0].status, SubtaskStatus::Ready);
        let worker = orch.worker("w1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::FailedOver);
    }
}
