//! Executor-side runtime for running assigned processes.
//!
//! An executor registers with the orchestrator, long-polls `assign`, runs the
//! leased process through a [`FunctionHandler`] and reports the outcome with
//! `close` or `fail`:
//!
//! - [`ExecutorLoop`]: the assign / execute / report cycle
//! - [`ShellHandler`](executor::ShellHandler): runs `func_name` plus args via `sh -c`
//! - [`LeaseHeartbeat`](heartbeat::LeaseHeartbeat): renews the lease while a
//!   long process runs so the deadline sweep leaves it alone
//!
//! # Execution Flow
//!
//! 1. [`ExecutorLoop::run`] calls `assign` with the configured timeout
//! 2. A heartbeat task renews the lease (if enabled)
//! 3. The handler returns output values or an error message
//! 4. Output closes the process; an error fails it (and may requeue it)
//!
//! # Security Note
//!
//! The shell handler runs commands directly on the host without sandboxing.

pub mod executor;
pub mod heartbeat;

pub use executor::{FunctionHandler, ShellHandler};
pub use heartbeat::LeaseHeartbeat;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::{FailOutcome, Orchestrator};
use crate::error::{ColonyError, Result};
use crate::scheduler::{Executor, Process};

/// Back-off after an unexpected assign error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct ExecutorLoop {
    orchestrator: Arc<Orchestrator>,
    executor: Executor,
    handler: Arc<dyn FunctionHandler>,
    assign_timeout: Duration,
    heartbeat_interval: Option<Duration>,
}

impl ExecutorLoop {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        executor: Executor,
        handler: Arc<dyn FunctionHandler>,
    ) -> Self {
        let assign_timeout = orchestrator.config().default_assign_timeout();
        Self {
            orchestrator,
            executor,
            handler,
            assign_timeout,
            heartbeat_interval: None,
        }
    }

    pub fn with_assign_timeout(mut self, timeout: Duration) -> Self {
        self.assign_timeout = timeout;
        self
    }

    /// Renew the lease every `interval` while a process runs.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Register the executor unless one with the same name already exists.
    pub async fn register(&self) -> Result<()> {
        match self.orchestrator.add_executor(self.executor.clone()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                tracing::debug!(executor = %self.executor.name, "Executor already registered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run processes until `shutdown` fires. Returns how many were executed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<usize> {
        self.register().await?;
        tracing::info!(
            executor = %self.executor.name,
            colony = %self.executor.colony_name,
            executor_type = %self.executor.executor_type,
            "Executor loop started"
        );

        let mut executed = 0;
        loop {
            match self.run_once(&shutdown).await {
                Ok(_) => executed += 1,
                Err(ColonyError::NoWorkAvailable { .. }) => {}
                Err(ColonyError::AssignCancelled) => break,
                Err(e) => {
                    tracing::warn!(executor = %self.executor.name, error = %e, "Executor loop error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!(executor = %self.executor.name, executed, "Executor loop stopped");
        Ok(executed)
    }

    /// Assign, execute and report a single process.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Process> {
        let process = self
            .orchestrator
            .assign(
                &self.executor.colony_name,
                &self.executor.name,
                self.assign_timeout,
                cancel,
            )
            .await?;

        let stop_heartbeat = CancellationToken::new();
        let heartbeat = self.heartbeat_interval.map(|interval| {
            let heartbeat = LeaseHeartbeat::new(interval);
            let orchestrator = self.orchestrator.clone();
            let executor_name = self.executor.name.clone();
            let stop = stop_heartbeat.clone();
            let process_id = process.id;
            tokio::spawn(async move {
                heartbeat
                    .run(&orchestrator, process_id, &executor_name, stop)
                    .await
            })
        });

        let result = self.handler.handle(&process).await;

        stop_heartbeat.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }

        match result {
            Ok(output) => {
                self.orchestrator
                    .close(process.id, &self.executor.name, output)
                    .await
            }
            Err(error) => {
                let outcome = self
                    .orchestrator
                    .fail(process.id, &self.executor.name, vec![error])
                    .await?;
                if let FailOutcome::Requeued(p) = &outcome {
                    tracing::info!(process_id = %p.id, retries = p.retries, "Process will be retried");
                }
                Ok(outcome.process().clone())
            }
        }
    }
}
