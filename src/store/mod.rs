//! Persistence seam for processes, graphs, triggers and executors.
//!
//! The store is the only shared mutable state; every orchestrator instance
//! talks to it. Each method is atomic on its own. Claims and state updates
//! are compare-and-set, so two instances racing on the same process see
//! exactly one winner and one [`ColonyError::Conflict`](crate::error::ColonyError).
//!
//! [`MemoryStore`] is the in-process implementation.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::graph::ChildInsertion;
use crate::scheduler::{Executor, GraphState, Process, ProcessGraph, ProcessState, Transition};
use crate::triggers::{Cron, Generator};

/// Who is asking for work.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub colony_name: String,
    pub executor_id: Uuid,
    pub executor_name: String,
    pub executor_type: String,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn for_executor(executor: &Executor, now: DateTime<Utc>) -> Self {
        Self {
            colony_name: executor.colony_name.clone(),
            executor_id: executor.id,
            executor_name: executor.name.clone(),
            executor_type: executor.executor_type.clone(),
            now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub state: Option<ProcessState>,
    pub executor_type: Option<String>,
    pub process_graph_id: Option<Uuid>,
}

impl ProcessFilter {
    pub fn in_state(state: ProcessState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn matches(&self, process: &Process) -> bool {
        self.state.map_or(true, |s| process.state == s)
            && self
                .executor_type
                .as_deref()
                .map_or(true, |t| process.executor_type() == t)
            && self
                .process_graph_id
                .map_or(true, |g| process.process_graph_id == Some(g))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColonyStatistics {
    pub colony_name: String,
    pub executors: usize,
    pub waiting_processes: usize,
    pub running_processes: usize,
    pub successful_processes: usize,
    pub failed_processes: usize,
    pub cancelled_processes: usize,
    pub waiting_graphs: usize,
    pub running_graphs: usize,
    pub successful_graphs: usize,
    pub failed_graphs: usize,
    pub cancelled_graphs: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub processes_removed: usize,
    pub graphs_removed: usize,
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    // -- processes --

    async fn add_process(&self, process: Process) -> Result<()>;

    async fn get_process(&self, id: Uuid) -> Result<Option<Process>>;

    /// Processes of a colony matching `filter`, oldest first.
    async fn find_processes(
        &self,
        colony_name: &str,
        filter: &ProcessFilter,
        limit: usize,
    ) -> Result<Vec<Process>>;

    /// Atomically pick and lease the next process for the claimant.
    async fn claim_next_waiting(&self, claim: &ClaimRequest) -> Result<Option<Process>>;

    /// Apply `transition` if the process still matches its snapshot,
    /// `Conflict` otherwise.
    async fn update_process_state(&self, transition: &Transition) -> Result<Process>;

    async fn set_wait_for_parents(&self, id: Uuid, wait: bool) -> Result<()>;

    async fn set_input(&self, id: Uuid, input: Vec<Value>) -> Result<()>;

    async fn set_output(&self, id: Uuid, output: Vec<Value>) -> Result<()>;

    async fn running_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Process>>;

    async fn waiting_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Process>>;

    // -- process graphs --

    /// Insert a graph and all of its members in one step.
    async fn add_process_graph(&self, graph: ProcessGraph, members: Vec<Process>) -> Result<()>;

    async fn get_process_graph(&self, id: Uuid) -> Result<Option<ProcessGraph>>;

    async fn get_graph_members(&self, id: Uuid) -> Result<Vec<Process>>;

    /// Re-derive the aggregate state from the current members.
    async fn refresh_process_graph(&self, id: Uuid, now: DateTime<Utc>) -> Result<ProcessGraph>;

    async fn find_process_graphs(
        &self,
        colony_name: &str,
        state: Option<GraphState>,
        limit: usize,
    ) -> Result<Vec<ProcessGraph>>;

    /// Add a node to a graph and rewrite the relations it touches.
    /// `Conflict` if the graph or a relinked member changed since planning.
    async fn insert_graph_member(&self, graph_id: Uuid, insertion: &ChildInsertion) -> Result<()>;

    // -- generators --

    async fn add_generator(&self, generator: Generator) -> Result<()>;

    async fn get_generator(&self, id: Uuid) -> Result<Option<Generator>>;

    async fn find_generators(&self, colony_name: Option<&str>) -> Result<Vec<Generator>>;

    async fn remove_generator(&self, id: Uuid) -> Result<bool>;

    /// Append `arg` and bump the queue size in one step.
    async fn increment_generator_queue(
        &self,
        id: Uuid,
        arg: Value,
        now: DateTime<Utc>,
    ) -> Result<Generator>;

    /// Remove exactly `count` oldest args, `Conflict` if fewer are queued.
    async fn drain_generator_args(&self, id: Uuid, count: usize) -> Result<Vec<Value>>;

    async fn record_generator_fire(
        &self,
        id: Uuid,
        graph_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Generator>;

    // -- crons --

    async fn add_cron(&self, cron: Cron) -> Result<()>;

    async fn get_cron(&self, id: Uuid) -> Result<Option<Cron>>;

    async fn find_crons(&self, colony_name: Option<&str>) -> Result<Vec<Cron>>;

    async fn remove_cron(&self, id: Uuid) -> Result<bool>;

    async fn get_due_crons(&self, now: DateTime<Utc>) -> Result<Vec<Cron>>;

    /// Move `next_run` forward if it still equals `expected`, `Conflict` otherwise.
    async fn advance_cron(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next_run: DateTime<Utc>,
    ) -> Result<()>;

    async fn record_cron_fire(&self, id: Uuid, graph_id: Uuid, now: DateTime<Utc>) -> Result<Cron>;

    // -- executors and colonies --

    async fn add_executor(&self, executor: Executor) -> Result<()>;

    async fn get_executor(&self, colony_name: &str, name: &str) -> Result<Option<Executor>>;

    async fn find_executors(&self, colony_name: &str) -> Result<Vec<Executor>>;

    async fn mark_executor_alive(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn set_colony_paused(&self, colony_name: &str, paused: bool) -> Result<()>;

    async fn is_colony_paused(&self, colony_name: &str) -> Result<bool>;

    async fn colony_statistics(&self, colony_name: &str) -> Result<ColonyStatistics>;

    /// Drop terminal graphs and standalone processes that ended before `cutoff`.
    async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<RetentionReport>;
}
