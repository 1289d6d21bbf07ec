use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::workflow::RootOverrides;
use crate::engine::Orchestrator;
use crate::error::{ColonyError, Result};
use crate::scheduler::{ProcessGraph, WorkflowSpec};
use crate::triggers::{gate_allows, Cron, Generator, Trigger};

/// Result of one checker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub fired: usize,
    /// Due, but held back by an unfinished previous graph.
    pub gated: usize,
    /// Lost a race with another instance or failed; retried next pass.
    pub skipped: usize,
}

enum CheckOutcome {
    Idle,
    Gated,
    Fired(usize),
    Lost,
}

impl TriggerReport {
    fn record(&mut self, outcome: CheckOutcome) {
        match outcome {
            CheckOutcome::Idle => {}
            CheckOutcome::Gated => self.gated += 1,
            CheckOutcome::Fired(count) => self.fired += count,
            CheckOutcome::Lost => self.skipped += 1,
        }
    }
}

impl Orchestrator {
    async fn gate_open<T: Trigger + Sync>(&self, trigger: &T) -> Result<bool> {
        let prev_state = match trigger.prev_graph_id() {
            Some(id) => self.store.get_process_graph(id).await?.map(|g| g.state),
            None => None,
        };
        Ok(gate_allows(trigger, prev_state))
    }

    // -- generators --

    pub async fn add_generator(&self, mut generator: Generator) -> Result<Generator> {
        generator.validate()?;
        if generator.initiator.is_empty() {
            generator.initiator = format!("generator:{}", generator.name);
        }
        self.store.add_generator(generator.clone()).await?;
        tracing::info!(
            generator_id = %generator.id,
            name = %generator.name,
            colony = %generator.colony_name,
            trigger = generator.trigger,
            timeout = generator.timeout,
            "Generator added"
        );
        Ok(generator)
    }

    pub async fn get_generator(&self, id: Uuid) -> Result<Generator> {
        self.store
            .get_generator(id)
            .await?
            .ok_or(ColonyError::GeneratorNotFound(id))
    }

    pub async fn list_generators(&self, colony_name: &str) -> Result<Vec<Generator>> {
        self.store.find_generators(Some(colony_name)).await
    }

    pub async fn remove_generator(&self, id: Uuid) -> Result<()> {
        if !self.store.remove_generator(id).await? {
            return Err(ColonyError::GeneratorNotFound(id));
        }
        tracing::info!(generator_id = %id, "Generator removed");
        Ok(())
    }

    /// Queue one argument for the generator's next workflow.
    pub async fn pack_generator(&self, id: Uuid, arg: Value) -> Result<Generator> {
        let generator = self
            .store
            .increment_generator_queue(id, arg, Utc::now())
            .await?;
        tracing::debug!(generator_id = %id, queue_size = generator.queue_size, "Generator packed");
        Ok(generator)
    }

    /// One generator checker pass.
    pub async fn check_generators(&self, now: DateTime<Utc>) -> Result<TriggerReport> {
        let mut report = TriggerReport::default();
        for generator in self.store.find_generators(None).await? {
            match self.check_generator(&generator, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!(generator_id = %generator.id, error = %e, "Generator check failed");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn check_generator(&self, generator: &Generator, now: DateTime<Utc>) -> Result<CheckOutcome> {
        if !generator.due_to_fire(now) {
            return Ok(CheckOutcome::Idle);
        }
        if !self.gate_open(generator).await? {
            tracing::debug!(generator_id = %generator.id, "Previous graph still running, holding generator");
            return Ok(CheckOutcome::Gated);
        }

        let workflow = generator.workflow_spec()?;
        let mut fired = 0;
        for size in generator.batches(now) {
            match self.fire_generator_batch(generator, &workflow, size, now).await {
                Ok(true) => fired += 1,
                Ok(false) => break,
                Err(e) if fired > 0 => {
                    tracing::error!(generator_id = %generator.id, fired, error = %e, "Generator batch failed");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(if fired == 0 {
            CheckOutcome::Lost
        } else {
            CheckOutcome::Fired(fired)
        })
    }

    /// Start one workflow with the `size` oldest args. Returns false when
    /// another instance drained them first.
    async fn fire_generator_batch(
        &self,
        generator: &Generator,
        workflow: &WorkflowSpec,
        size: usize,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let args = match self.store.drain_generator_args(generator.id, size).await {
            Ok(args) => args,
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e),
        };

        let overrides = RootOverrides {
            args: Some(args.clone()),
            input: Vec::new(),
        };
        let graph = match self
            .create_process_graph(workflow.clone(), &generator.initiator, overrides)
            .await
        {
            Ok(graph) => graph,
            Err(e) => {
                for arg in args {
                    self.store
                        .increment_generator_queue(generator.id, arg, now)
                        .await?;
                }
                return Err(e);
            }
        };

        self.store
            .record_generator_fire(generator.id, graph.id, now)
            .await?;
        tracing::info!(
            generator_id = %generator.id,
            graph_id = %graph.id,
            args = size,
            "Generator fired"
        );
        Ok(true)
    }

    // -- crons --

    /// Register a cron and schedule its first run.
    pub async fn add_cron(&self, mut cron: Cron) -> Result<Cron> {
        cron.validate()?;
        if cron.initiator.is_empty() {
            cron.initiator = format!("cron:{}", cron.name);
        }
        cron.next_run = Some(cron.next_run_after(Utc::now())?);
        self.store.add_cron(cron.clone()).await?;
        tracing::info!(
            cron_id = %cron.id,
            name = %cron.name,
            colony = %cron.colony_name,
            next_run = ?cron.next_run,
            "Cron added"
        );
        Ok(cron)
    }

    pub async fn get_cron(&self, id: Uuid) -> Result<Cron> {
        self.store
            .get_cron(id)
            .await?
            .ok_or(ColonyError::CronNotFound(id))
    }

    pub async fn list_crons(&self, colony_name: &str) -> Result<Vec<Cron>> {
        self.store.find_crons(Some(colony_name)).await
    }

    pub async fn remove_cron(&self, id: Uuid) -> Result<()> {
        if !self.store.remove_cron(id).await? {
            return Err(ColonyError::CronNotFound(id));
        }
        tracing::info!(cron_id = %id, "Cron removed");
        Ok(())
    }

    /// Fire a cron now without moving its schedule. Returns `None` when the
    /// previous graph is still running and the cron waits for it.
    pub async fn run_cron(&self, id: Uuid) -> Result<Option<ProcessGraph>> {
        let cron = self.get_cron(id).await?;
        if !self.gate_open(&cron).await? {
            tracing::info!(cron_id = %id, "Previous graph still running, cron not started");
            return Ok(None);
        }
        self.fire_cron(&cron, Utc::now()).await.map(Some)
    }

    /// One cron checker pass.
    pub async fn check_crons(&self, now: DateTime<Utc>) -> Result<TriggerReport> {
        let mut report = TriggerReport::default();
        for cron in self.store.get_due_crons(now).await? {
            match self.check_cron(&cron, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!(cron_id = %cron.id, error = %e, "Cron check failed");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn check_cron(&self, cron: &Cron, now: DateTime<Utc>) -> Result<CheckOutcome> {
        if !cron.due_to_fire(now) {
            return Ok(CheckOutcome::Idle);
        }
        if !self.gate_open(cron).await? {
            tracing::debug!(cron_id = %cron.id, "Previous graph still running, holding cron");
            return Ok(CheckOutcome::Gated);
        }

        let next_run = cron.next_run_after(now)?;
        match self.store.advance_cron(cron.id, cron.next_run, next_run).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Ok(CheckOutcome::Lost),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.fire_cron(cron, now).await {
            tracing::error!(cron_id = %cron.id, error = %e, "Cron fire failed, restoring schedule");
            if let Some(prev) = cron.next_run {
                match self.store.advance_cron(cron.id, Some(next_run), prev).await {
                    Ok(()) => {}
                    Err(rollback) if rollback.is_conflict() => {}
                    Err(rollback) => {
                        tracing::error!(cron_id = %cron.id, error = %rollback, "Cron schedule restore failed")
                    }
                }
            }
            return Err(e);
        }
        Ok(CheckOutcome::Fired(1))
    }

    async fn fire_cron(&self, cron: &Cron, now: DateTime<Utc>) -> Result<ProcessGraph> {
        let workflow = cron.workflow_spec()?;
        let overrides = RootOverrides {
            args: None,
            input: self.previous_leaf_outputs(cron).await?,
        };
        let graph = self
            .create_process_graph(workflow, &cron.initiator, overrides)
            .await?;
        self.store.record_cron_fire(cron.id, graph.id, now).await?;

        tracing::info!(cron_id = %cron.id, graph_id = %graph.id, "Cron fired");
        Ok(graph)
    }

    /// Outputs of the leaves of the cron's previous graph, in graph order.
    async fn previous_leaf_outputs(&self, cron: &Cron) -> Result<Vec<Value>> {
        let Some(prev_id) = cron.prev_graph_id else {
            return Ok(Vec::new());
        };
        let Some(prev) = self.store.get_process_graph(prev_id).await? else {
            return Ok(Vec::new());
        };
        let members = self.store.get_graph_members(prev_id).await?;
        Ok(prev
            .leaves(&members)
            .into_iter()
            .flat_map(|p| p.output.iter().cloned())
            .collect())
    }
}
