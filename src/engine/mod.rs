//! The orchestrator: every client-, executor- and timer-driven operation.
//!
//! [`Orchestrator`] holds no scheduling state of its own beyond wake-up
//! channels and per-colony exclusive-assign locks; everything else lives in
//! the [`ProcessStore`]. Several instances may share one store.
//!
//! Operations are grouped by concern:
//!
//! - [`lease`]: assign long-poll, close / fail / cancel, lease renewal and
//!   the deadline sweep
//! - [`workflow`]: submission, DAG gating, failure cascades, dynamic
//!   extension
//! - [`triggers`]: generator and cron management plus their checkers
//! - [`retention`]: periodic removal of old terminal records
//!
//! [`Orchestrator::spawn_background`] starts the periodic loops.

pub mod lease;
pub mod notify;
pub mod retention;
pub mod triggers;
pub mod workflow;

pub use lease::{FailOutcome, SweepReport};
pub use triggers::TriggerReport;
pub use workflow::RootOverrides;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ColonyError, Result};
use crate::scheduler::selector;
use crate::scheduler::{Executor, GraphState, Process, ProcessGraph, ProcessState};
use crate::store::{ColonyStatistics, ProcessFilter, ProcessStore};
use notify::WakeRegistry;

/// Upper bound on candidates inspected by `prioritize`.
const PRIORITIZE_SCAN_LIMIT: usize = 10_000;

pub struct Orchestrator {
    store: Arc<dyn ProcessStore>,
    config: SchedulerConfig,
    wakeups: WakeRegistry,
    exclusive_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ProcessStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            wakeups: WakeRegistry::new(),
            exclusive_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the deadline sweep, both trigger checkers and (if enabled)
    /// retention. Each loop stops when `shutdown` is cancelled.
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let this = self.clone();
        handles.push(tokio::spawn(run_periodic(
            "deadline_sweep",
            Duration::from_millis(self.config.deadline_sweep_period_ms),
            shutdown.clone(),
            move || {
                let this = this.clone();
                async move { this.sweep_deadlines(Utc::now()).await.map(|_| ()) }
            },
        )));

        let this = self.clone();
        handles.push(tokio::spawn(run_periodic(
            "generator_checker",
            Duration::from_millis(self.config.generator_checker_period_ms),
            shutdown.clone(),
            move || {
                let this = this.clone();
                async move { this.check_generators(Utc::now()).await.map(|_| ()) }
            },
        )));

        let this = self.clone();
        handles.push(tokio::spawn(run_periodic(
            "cron_checker",
            Duration::from_millis(self.config.cron_checker_period_ms),
            shutdown.clone(),
            move || {
                let this = this.clone();
                async move { this.check_crons(Utc::now()).await.map(|_| ()) }
            },
        )));

        if self.config.retention.enabled {
            let this = self.clone();
            handles.push(tokio::spawn(run_periodic(
                "retention",
                Duration::from_millis(self.config.retention.period_ms),
                shutdown,
                move || {
                    let this = this.clone();
                    async move { this.apply_retention(Utc::now()).await.map(|_| ()) }
                },
            )));
        }

        handles
    }

    // -- executors and colonies --

    pub async fn add_executor(&self, executor: Executor) -> Result<Executor> {
        executor.validate()?;
        self.store.add_executor(executor.clone()).await?;
        tracing::info!(
            executor = %executor.name,
            executor_type = %executor.executor_type,
            colony = %executor.colony_name,
            "Executor registered"
        );
        Ok(executor)
    }

    pub async fn get_executor(&self, colony_name: &str, name: &str) -> Result<Executor> {
        self.store
            .get_executor(colony_name, name)
            .await?
            .ok_or_else(|| ColonyError::ExecutorNotFound(format!("{}/{}", colony_name, name)))
    }

    pub async fn list_executors(&self, colony_name: &str) -> Result<Vec<Executor>> {
        self.store.find_executors(colony_name).await
    }

    /// Stop handing out work in a colony. Waiting assigns stay suspended.
    pub async fn pause_assignments(&self, colony_name: &str) -> Result<()> {
        self.store.set_colony_paused(colony_name, true).await?;
        tracing::info!(colony = %colony_name, "Assignments paused");
        Ok(())
    }

    pub async fn resume_assignments(&self, colony_name: &str) -> Result<()> {
        self.store.set_colony_paused(colony_name, false).await?;
        self.wakeups.wake_colony(colony_name).await;
        tracing::info!(colony = %colony_name, "Assignments resumed");
        Ok(())
    }

    pub async fn colony_statistics(&self, colony_name: &str) -> Result<ColonyStatistics> {
        self.store.colony_statistics(colony_name).await
    }

    // -- queries --

    pub async fn get_process(&self, id: Uuid) -> Result<Process> {
        self.store
            .get_process(id)
            .await?
            .ok_or(ColonyError::ProcessNotFound(id))
    }

    pub async fn get_process_graph(&self, id: Uuid) -> Result<ProcessGraph> {
        self.store
            .get_process_graph(id)
            .await?
            .ok_or(ColonyError::ProcessGraphNotFound(id))
    }

    pub async fn find_processes(
        &self,
        colony_name: &str,
        filter: &ProcessFilter,
        limit: usize,
    ) -> Result<Vec<Process>> {
        self.store.find_processes(colony_name, filter, limit).await
    }

    pub async fn find_process_graphs(
        &self,
        colony_name: &str,
        state: Option<GraphState>,
        limit: usize,
    ) -> Result<Vec<ProcessGraph>> {
        self.store.find_process_graphs(colony_name, state, limit).await
    }

    /// The next `count` processes `executor_name` would receive, without leasing them.
    pub async fn prioritize(
        &self,
        colony_name: &str,
        executor_name: &str,
        count: usize,
    ) -> Result<Vec<Process>> {
        let executor = self.get_executor(colony_name, executor_name).await?;
        let filter = ProcessFilter {
            state: Some(ProcessState::Waiting),
            executor_type: Some(executor.executor_type.clone()),
            process_graph_id: None,
        };
        let candidates: Vec<Process> = self
            .store
            .find_processes(colony_name, &filter, PRIORITIZE_SCAN_LIMIT)
            .await?
            .into_iter()
            .filter(Process::is_claimable)
            .collect();

        Ok(selector::prioritize(&executor.name, &candidates, count)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn exclusive_lock(&self, colony_name: &str) -> Option<Arc<Mutex<()>>> {
        if !self.config.colony(colony_name).exclusive_assign {
            return None;
        }
        let mut locks = self.exclusive_locks.lock().await;
        Some(
            locks
                .entry(colony_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        )
    }
}

/// Drive `tick` every `period` until `shutdown` fires. Errors are logged and
/// the loop carries on; missed ticks are skipped rather than bunched up.
async fn run_periodic<F, Fut>(
    task: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    tracing::info!(task, period_ms = period.as_millis() as u64, "Starting background loop");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(task, "Background loop stopped");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = tick().await {
                    tracing::error!(task, error = %e, "Background tick failed");
                }
            }
        }
    }
}
