use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Orchestrator;
use crate::error::{ColonyError, Result};
use crate::scheduler::process::EXEC_TIMEOUT_ERROR;
use crate::scheduler::{Executor, Process, ProcessState, Transition};
use crate::store::ClaimRequest;

/// What a failure report did to the process.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Retries remain; the process is back in WAITING.
    Requeued(Process),
    /// Retries exhausted; the process is FAILED.
    Failed(Process),
    /// The process was already terminal.
    Unchanged(Process),
}

impl FailOutcome {
    pub fn process(&self) -> &Process {
        match self {
            FailOutcome::Requeued(p) | FailOutcome::Failed(p) | FailOutcome::Unchanged(p) => p,
        }
    }
}

/// Result of one deadline sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub exec_requeued: usize,
    pub exec_failed: usize,
    pub wait_expired: usize,
}

impl Orchestrator {
    /// Long-poll for work. Returns a RUNNING process leased to the executor,
    /// `NoWorkAvailable` once `timeout` elapses, or `AssignCancelled` if
    /// `cancel` fires first.
    pub async fn assign(
        &self,
        colony_name: &str,
        executor_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Process> {
        let executor = self.get_executor(colony_name, executor_name).await?;
        let deadline = Instant::now() + timeout;
        let notify = self
            .wakeups
            .channel(colony_name, &executor.executor_type)
            .await;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Utc::now();
            self.store.mark_executor_alive(executor.id, now).await?;

            let mut conflicted = false;
            match self.try_claim(&executor, now).await {
                Ok(Some(process)) => return Ok(process),
                Ok(None) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(executor = %executor.name, error = %e, "Claim lost a race, retrying");
                    conflicted = true;
                }
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ColonyError::NoWorkAvailable {
                    colony: colony_name.to_string(),
                    executor: executor.name.clone(),
                });
            }
            if conflicted {
                continue;
            }

            let poll = self.config.assign_poll_interval().min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ColonyError::AssignCancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn try_claim(&self, executor: &Executor, now: DateTime<Utc>) -> Result<Option<Process>> {
        let lock = self.exclusive_lock(&executor.colony_name).await;
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let claim = ClaimRequest::for_executor(executor, now);
        let Some(mut process) = self.store.claim_next_waiting(&claim).await? else {
            return Ok(None);
        };

        if !process.parents.is_empty() {
            let input = self.parent_outputs(&process).await?;
            self.store.set_input(process.id, input.clone()).await?;
            process.input = input;
        }
        if let Some(graph_id) = process.process_graph_id {
            self.store.refresh_process_graph(graph_id, now).await?;
        }

        tracing::info!(
            process_id = %process.id,
            executor = %executor.name,
            colony = %executor.colony_name,
            func = %process.spec.func_name,
            "Process assigned"
        );
        Ok(Some(process))
    }

    async fn parent_outputs(&self, process: &Process) -> Result<Vec<Value>> {
        let mut input = Vec::new();
        for parent_id in &process.parents {
            if let Some(parent) = self.store.get_process(*parent_id).await? {
                input.extend(parent.output);
            }
        }
        Ok(input)
    }

    /// Report success on behalf of the lease holder. Closing a process that
    /// is already terminal is a no-op.
    pub async fn close(
        &self,
        process_id: Uuid,
        executor_name: &str,
        output: Vec<Value>,
    ) -> Result<Process> {
        let process = self.get_process(process_id).await?;
        if process.is_terminal() {
            return Ok(process);
        }
        let executor = self
            .get_executor(process.colony_name(), executor_name)
            .await?;
        process.check_lease_owner(executor.id, &executor.name)?;

        let Some(transition) = process.plan_close(output, Utc::now())? else {
            return Ok(process);
        };
        let closed = self.store.update_process_state(&transition).await?;
        tracing::info!(process_id = %process_id, executor = %executor.name, "Process closed");

        self.on_process_changed(&closed).await?;
        Ok(closed)
    }

    /// Report failure on behalf of the lease holder. Requeues while retries
    /// remain.
    pub async fn fail(
        &self,
        process_id: Uuid,
        executor_name: &str,
        errors: Vec<String>,
    ) -> Result<FailOutcome> {
        let process = self.get_process(process_id).await?;
        if process.is_terminal() {
            return Ok(FailOutcome::Unchanged(process));
        }
        let executor = self
            .get_executor(process.colony_name(), executor_name)
            .await?;
        process.check_lease_owner(executor.id, &executor.name)?;

        match process.plan_fail(&errors, Utc::now())? {
            Some(transition) => self.apply_failure(&transition).await,
            None => Ok(FailOutcome::Unchanged(process)),
        }
    }

    async fn apply_failure(&self, transition: &Transition) -> Result<FailOutcome> {
        let process = self.store.update_process_state(transition).await?;

        if process.state == ProcessState::Waiting {
            tracing::warn!(
                process_id = %process.id,
                retries = process.retries,
                max_retries = process.spec.max_retries,
                "Process failed, requeued"
            );
            self.wakeups
                .wake(process.colony_name(), process.executor_type())
                .await;
            return Ok(FailOutcome::Requeued(process));
        }

        tracing::warn!(
            process_id = %process.id,
            retries = process.retries,
            errors = ?process.errors,
            "Process failed"
        );
        self.on_process_changed(&process).await?;
        Ok(FailOutcome::Failed(process))
    }

    /// Cancel a process and every un-started process depending on it.
    pub async fn cancel(&self, process_id: Uuid) -> Result<Process> {
        let process = self.get_process(process_id).await?;
        let Some(transition) = process.plan_cancel(Utc::now()) else {
            return Ok(process);
        };

        let cancelled = self.store.update_process_state(&transition).await?;
        tracing::info!(process_id = %process_id, "Process cancelled");

        self.on_process_changed(&cancelled).await?;
        Ok(cancelled)
    }

    /// Extend the lease held by `executor_name`.
    pub async fn renew(&self, process_id: Uuid, executor_name: &str) -> Result<Process> {
        let process = self.get_process(process_id).await?;
        let executor = self
            .get_executor(process.colony_name(), executor_name)
            .await?;
        let now = Utc::now();

        process.check_lease_owner(executor.id, &executor.name)?;
        let transition = process.plan_renew(executor.id, now)?;
        let renewed = self.store.update_process_state(&transition).await?;
        self.store.mark_executor_alive(executor.id, now).await?;

        tracing::debug!(process_id = %process_id, executor = %executor.name, "Lease renewed");
        Ok(renewed)
    }

    /// Replace the output of a running process.
    pub async fn set_output(&self, process_id: Uuid, output: Vec<Value>) -> Result<()> {
        let process = self.get_process(process_id).await?;
        if process.state != ProcessState::Running {
            return Err(ColonyError::Validation(format!(
                "cannot set output on {} process {}",
                process.state, process_id
            )));
        }
        self.store.set_output(process_id, output).await
    }

    /// Fail RUNNING processes past their exec deadline (as if the executor
    /// had reported failure) and WAITING processes past their wait deadline.
    pub async fn sweep_deadlines(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for process in self.store.running_past_deadline(now).await? {
            let Some(transition) = process.plan_fail(&[EXEC_TIMEOUT_ERROR.to_string()], now)? else {
                continue;
            };
            match self.apply_failure(&transition).await {
                Ok(FailOutcome::Requeued(_)) => report.exec_requeued += 1,
                Ok(FailOutcome::Failed(_)) => report.exec_failed += 1,
                Ok(FailOutcome::Unchanged(_)) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(process_id = %process.id, "Process changed during sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        for process in self.store.waiting_past_deadline(now).await? {
            let transition = process.plan_wait_timeout(now)?;
            match self.store.update_process_state(&transition).await {
                Ok(expired) => {
                    tracing::warn!(process_id = %expired.id, "Process exceeded its wait deadline");
                    report.wait_expired += 1;
                    self.on_process_changed(&expired).await?;
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(process_id = %process.id, "Process changed during sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                exec_requeued = report.exec_requeued,
                exec_failed = report.exec_failed,
                wait_expired = report.wait_expired,
                "Deadline sweep"
            );
        }
        Ok(report)
    }
}
