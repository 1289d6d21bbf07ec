use chrono::{DateTime, Duration, Utc};

use crate::engine::Orchestrator;
use crate::error::Result;
use crate::scheduler::spec::MAX_DURATION_SECS;
use crate::store::RetentionReport;

impl Orchestrator {
    /// Remove terminal graphs and standalone processes older than the
    /// retention policy allows.
    pub async fn apply_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let max_age = i64::try_from(self.config.retention.policy.max_age_secs)
            .unwrap_or(MAX_DURATION_SECS)
            .min(MAX_DURATION_SECS);
        let cutoff = now - Duration::seconds(max_age);
        let report = self.store.remove_terminal_before(cutoff).await?;

        if report.processes_removed > 0 || report.graphs_removed > 0 {
            tracing::info!(
                processes = report.processes_removed,
                graphs = report.graphs_removed,
                cutoff = %cutoff,
                "Retention removed old records"
            );
        }
        Ok(report)
    }
}
