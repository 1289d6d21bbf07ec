use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Orchestrator;

/// Periodically renews a process lease on behalf of an executor.
pub struct LeaseHeartbeat {
    interval: Duration,
}

impl LeaseHeartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Renew until `stop` fires or the lease is lost. Returns the number of
    /// successful renewals.
    pub async fn run(
        &self,
        orchestrator: &Orchestrator,
        process_id: Uuid,
        executor_name: &str,
        stop: CancellationToken,
    ) -> usize {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the lease was just granted.
        interval.tick().await;

        let mut renewals = 0;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    match orchestrator.renew(process_id, executor_name).await {
                        Ok(_) => renewals += 1,
                        Err(e) => {
                            tracing::warn!(
                                process_id = %process_id,
                                executor = executor_name,
                                error = %e,
                                "Lease lost, stopping heartbeat"
                            );
                            break;
                        }
                    }
                }
            }
        }
        renewals
    }
}
