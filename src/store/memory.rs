use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ColonyError, Result};
use crate::scheduler::graph::ChildInsertion;
use crate::scheduler::selector;
use crate::scheduler::{Executor, GraphState, Process, ProcessGraph, ProcessState, Transition};
use crate::store::{ClaimRequest, ColonyStatistics, ProcessFilter, ProcessStore, RetentionReport};
use crate::triggers::{Cron, Generator, Trigger};

const DEFAULT_MAX_PROCESSES: usize = 100_000;

#[derive(Debug, Default)]
struct MemoryState {
    processes: HashMap<Uuid, Process>,
    graphs: HashMap<Uuid, ProcessGraph>,
    generators: HashMap<Uuid, Generator>,
    crons: HashMap<Uuid, Cron>,
    executors: HashMap<Uuid, Executor>,
    paused: HashSet<String>,
}

impl MemoryState {
    fn process_mut(&mut self, id: Uuid) -> Result<&mut Process> {
        self.processes
            .get_mut(&id)
            .ok_or(ColonyError::ProcessNotFound(id))
    }

    fn generator_mut(&mut self, id: Uuid) -> Result<&mut Generator> {
        self.generators
            .get_mut(&id)
            .ok_or(ColonyError::GeneratorNotFound(id))
    }

    fn cron_mut(&mut self, id: Uuid) -> Result<&mut Cron> {
        self.crons.get_mut(&id).ok_or(ColonyError::CronNotFound(id))
    }

    fn members_of(&self, graph: &ProcessGraph) -> Vec<Process> {
        graph
            .process_ids
            .iter()
            .filter_map(|id| self.processes.get(id).cloned())
            .collect()
    }
}

/// In-process store. All state sits behind one lock, so every trait method
/// is a single critical section.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    max_processes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PROCESSES)
    }

    pub fn with_capacity(max_processes: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            max_processes,
        }
    }

    /// Number of stored processes across all colonies.
    pub async fn len(&self) -> usize {
        self.state.read().await.processes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.processes.is_empty()
    }

    fn ensure_room(&self, state: &MemoryState, adding: usize) -> Result<()> {
        if state.processes.len() + adding > self.max_processes {
            return Err(ColonyError::StoreFull(self.max_processes));
        }
        Ok(())
    }
}

fn oldest_first(processes: &mut [Process]) {
    processes.sort_by_key(|p| (p.submission_time, p.id));
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn add_process(&self, process: Process) -> Result<()> {
        let mut state = self.state.write().await;
        self.ensure_room(&state, 1)?;
        if state.processes.contains_key(&process.id) {
            return Err(ColonyError::Conflict(format!(
                "process {} already exists",
                process.id
            )));
        }
        state.processes.insert(process.id, process);
        Ok(())
    }

    async fn get_process(&self, id: Uuid) -> Result<Option<Process>> {
        Ok(self.state.read().await.processes.get(&id).cloned())
    }

    async fn find_processes(
        &self,
        colony_name: &str,
        filter: &ProcessFilter,
        limit: usize,
    ) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        let mut found: Vec<Process> = state
            .processes
            .values()
            .filter(|p| p.colony_name() == colony_name && filter.matches(p))
            .cloned()
            .collect();
        oldest_first(&mut found);
        found.truncate(limit);
        Ok(found)
    }

    async fn claim_next_waiting(&self, claim: &ClaimRequest) -> Result<Option<Process>> {
        let mut state = self.state.write().await;
        if state.paused.contains(&claim.colony_name) {
            return Ok(None);
        }

        let candidates: Vec<Process> = state
            .processes
            .values()
            .filter(|p| {
                p.is_claimable()
                    && p.colony_name() == claim.colony_name
                    && p.executor_type() == claim.executor_type
            })
            .cloned()
            .collect();

        let transition = match selector::select(&claim.executor_name, &candidates) {
            Some(chosen) => chosen.plan_assign(claim.executor_id, claim.now)?,
            None => return Ok(None),
        };

        let process = state.process_mut(transition.process_id)?;
        process.apply(&transition);
        Ok(Some(process.clone()))
    }

    async fn update_process_state(&self, transition: &Transition) -> Result<Process> {
        let mut state = self.state.write().await;
        let process = state.process_mut(transition.process_id)?;
        if !transition.matches(process) {
            return Err(ColonyError::Conflict(format!(
                "process {} is {} (retries {}), transition planned from {} (retries {})",
                process.id,
                process.state,
                process.retries,
                transition.from,
                transition.expected_retries
            )));
        }
        process.apply(transition);
        Ok(process.clone())
    }

    async fn set_wait_for_parents(&self, id: Uuid, wait: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.process_mut(id)?.wait_for_parents = wait;
        Ok(())
    }

    async fn set_input(&self, id: Uuid, input: Vec<Value>) -> Result<()> {
        let mut state = self.state.write().await;
        state.process_mut(id)?.input = input;
        Ok(())
    }

    async fn set_output(&self, id: Uuid, output: Vec<Value>) -> Result<()> {
        let mut state = self.state.write().await;
        state.process_mut(id)?.output = output;
        Ok(())
    }

    async fn running_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        Ok(state
            .processes
            .values()
            .filter(|p| {
                p.state == ProcessState::Running && p.exec_deadline.is_some_and(|d| d < now)
            })
            .cloned()
            .collect())
    }

    async fn waiting_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        Ok(state
            .processes
            .values()
            .filter(|p| {
                p.state == ProcessState::Waiting && p.wait_deadline.is_some_and(|d| d < now)
            })
            .cloned()
            .collect())
    }

    async fn add_process_graph(&self, graph: ProcessGraph, members: Vec<Process>) -> Result<()> {
        let mut state = self.state.write().await;
        self.ensure_room(&state, members.len())?;
        if state.graphs.contains_key(&graph.id) {
            return Err(ColonyError::Conflict(format!(
                "process graph {} already exists",
                graph.id
            )));
        }
        for process in members {
            state.processes.insert(process.id, process);
        }
        state.graphs.insert(graph.id, graph);
        Ok(())
    }

    async fn get_process_graph(&self, id: Uuid) -> Result<Option<ProcessGraph>> {
        Ok(self.state.read().await.graphs.get(&id).cloned())
    }

    async fn get_graph_members(&self, id: Uuid) -> Result<Vec<Process>> {
        let state = self.state.read().await;
        let graph = state
            .graphs
            .get(&id)
            .ok_or(ColonyError::ProcessGraphNotFound(id))?;
        Ok(state.members_of(graph))
    }

    async fn refresh_process_graph(&self, id: Uuid, now: DateTime<Utc>) -> Result<ProcessGraph> {
        let mut state = self.state.write().await;
        let members = state
            .graphs
            .get(&id)
            .map(|g| state.members_of(g))
            .ok_or(ColonyError::ProcessGraphNotFound(id))?;
        let graph = state
            .graphs
            .get_mut(&id)
            .ok_or(ColonyError::ProcessGraphNotFound(id))?;
        graph.refresh(&members, now);
        Ok(graph.clone())
    }

    async fn find_process_graphs(
        &self,
        colony_name: &str,
        graph_state: Option<GraphState>,
        limit: usize,
    ) -> Result<Vec<ProcessGraph>> {
        let state = self.state.read().await;
        let mut found: Vec<ProcessGraph> = state
            .graphs
            .values()
            .filter(|g| g.colony_name == colony_name && graph_state.map_or(true, |s| g.state == s))
            .cloned()
            .collect();
        found.sort_by_key(|g| (g.submission_time, g.id));
        found.truncate(limit);
        Ok(found)
    }

    async fn insert_graph_member(&self, graph_id: Uuid, insertion: &ChildInsertion) -> Result<()> {
        let mut state = self.state.write().await;
        self.ensure_room(&state, 1)?;
        let graph = state
            .graphs
            .get(&graph_id)
            .ok_or(ColonyError::ProcessGraphNotFound(graph_id))?;
        if graph.state.is_terminal() {
            return Err(ColonyError::Conflict(format!(
                "process graph {} became {}",
                graph_id, graph.state
            )));
        }
        if graph.nodes.contains_key(insertion.process.node_name()) {
            return Err(ColonyError::Conflict(format!(
                "node name '{}' was taken in graph {}",
                insertion.process.node_name(),
                graph_id
            )));
        }
        for relink in &insertion.relinks {
            let process = state
                .processes
                .get(&relink.process_id)
                .ok_or(ColonyError::ProcessNotFound(relink.process_id))?;
            if !relink.matches(process) {
                return Err(ColonyError::Conflict(format!(
                    "process {} changed since graph {} was edited",
                    relink.process_id, graph_id
                )));
            }
        }

        for relink in &insertion.relinks {
            let process = state.process_mut(relink.process_id)?;
            process.parents = relink.parents.clone();
            process.children = relink.children.clone();
            if let Some(wait) = relink.wait_for_parents {
                process.wait_for_parents = wait;
            }
        }
        if let Some(graph) = state.graphs.get_mut(&graph_id) {
            graph.add_member(&insertion.process);
        }
        state
            .processes
            .insert(insertion.process.id, insertion.process.clone());
        Ok(())
    }

    async fn add_generator(&self, generator: Generator) -> Result<()> {
        let mut state = self.state.write().await;
        state.generators.insert(generator.id, generator);
        Ok(())
    }

    async fn get_generator(&self, id: Uuid) -> Result<Option<Generator>> {
        Ok(self.state.read().await.generators.get(&id).cloned())
    }

    async fn find_generators(&self, colony_name: Option<&str>) -> Result<Vec<Generator>> {
        let state = self.state.read().await;
        let mut found: Vec<Generator> = state
            .generators
            .values()
            .filter(|g| colony_name.map_or(true, |c| g.colony_name == c))
            .cloned()
            .collect();
        found.sort_by_key(|g| (g.created_at, g.id));
        Ok(found)
    }

    async fn remove_generator(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.generators.remove(&id).is_some())
    }

    async fn increment_generator_queue(
        &self,
        id: Uuid,
        arg: Value,
        now: DateTime<Utc>,
    ) -> Result<Generator> {
        let mut state = self.state.write().await;
        let generator = state.generator_mut(id)?;
        generator.pack(arg, now);
        Ok(generator.clone())
    }

    async fn drain_generator_args(&self, id: Uuid, count: usize) -> Result<Vec<Value>> {
        let mut state = self.state.write().await;
        state.generator_mut(id)?.take(count)
    }

    async fn record_generator_fire(
        &self,
        id: Uuid,
        graph_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Generator> {
        let mut state = self.state.write().await;
        let generator = state.generator_mut(id)?;
        generator.on_fired(graph_id, now);
        Ok(generator.clone())
    }

    async fn add_cron(&self, cron: Cron) -> Result<()> {
        let mut state = self.state.write().await;
        state.crons.insert(cron.id, cron);
        Ok(())
    }

    async fn get_cron(&self, id: Uuid) -> Result<Option<Cron>> {
        Ok(self.state.read().await.crons.get(&id).cloned())
    }

    async fn find_crons(&self, colony_name: Option<&str>) -> Result<Vec<Cron>> {
        let state = self.state.read().await;
        let mut found: Vec<Cron> = state
            .crons
            .values()
            .filter(|c| colony_name.map_or(true, |name| c.colony_name == name))
            .cloned()
            .collect();
        found.sort_by_key(|c| (c.created_at, c.id));
        Ok(found)
    }

    async fn remove_cron(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.crons.remove(&id).is_some())
    }

    async fn get_due_crons(&self, now: DateTime<Utc>) -> Result<Vec<Cron>> {
        let state = self.state.read().await;
        let mut due: Vec<Cron> = state
            .crons
            .values()
            .filter(|c| c.due_to_fire(now))
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.next_run, c.id));
        Ok(due)
    }

    async fn advance_cron(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let cron = state.cron_mut(id)?;
        if cron.next_run != expected {
            return Err(ColonyError::Conflict(format!(
                "cron {} next run moved to {:?}",
                id, cron.next_run
            )));
        }
        cron.next_run = Some(next_run);
        Ok(())
    }

    async fn record_cron_fire(&self, id: Uuid, graph_id: Uuid, now: DateTime<Utc>) -> Result<Cron> {
        let mut state = self.state.write().await;
        let cron = state.cron_mut(id)?;
        cron.on_fired(graph_id, now);
        Ok(cron.clone())
    }

    async fn add_executor(&self, executor: Executor) -> Result<()> {
        let mut state = self.state.write().await;
        let taken = state
            .executors
            .values()
            .any(|e| e.colony_name == executor.colony_name && e.name == executor.name);
        if taken {
            return Err(ColonyError::Conflict(format!(
                "executor '{}' already registered in colony '{}'",
                executor.name, executor.colony_name
            )));
        }
        state.executors.insert(executor.id, executor);
        Ok(())
    }

    async fn get_executor(&self, colony_name: &str, name: &str) -> Result<Option<Executor>> {
        let state = self.state.read().await;
        Ok(state
            .executors
            .values()
            .find(|e| e.colony_name == colony_name && e.name == name)
            .cloned())
    }

    async fn find_executors(&self, colony_name: &str) -> Result<Vec<Executor>> {
        let state = self.state.read().await;
        let mut found: Vec<Executor> = state
            .executors
            .values()
            .filter(|e| e.colony_name == colony_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn mark_executor_alive(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let executor = state
            .executors
            .get_mut(&id)
            .ok_or_else(|| ColonyError::ExecutorNotFound(id.to_string()))?;
        executor.last_heard_from = Some(now);
        Ok(())
    }

    async fn set_colony_paused(&self, colony_name: &str, paused: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if paused {
            state.paused.insert(colony_name.to_string());
        } else {
            state.paused.remove(colony_name);
        }
        Ok(())
    }

    async fn is_colony_paused(&self, colony_name: &str) -> Result<bool> {
        Ok(self.state.read().await.paused.contains(colony_name))
    }

    async fn colony_statistics(&self, colony_name: &str) -> Result<ColonyStatistics> {
        let state = self.state.read().await;
        let mut stats = ColonyStatistics {
            colony_name: colony_name.to_string(),
            paused: state.paused.contains(colony_name),
            executors: state
                .executors
                .values()
                .filter(|e| e.colony_name == colony_name)
                .count(),
            ..Default::default()
        };

        for process in state.processes.values().filter(|p| p.colony_name() == colony_name) {
            match process.state {
                ProcessState::Waiting => stats.waiting_processes += 1,
                ProcessState::Running => stats.running_processes += 1,
                ProcessState::Success => stats.successful_processes += 1,
                ProcessState::Failed => stats.failed_processes += 1,
                ProcessState::Cancelled => stats.cancelled_processes += 1,
            }
        }
        for graph in state.graphs.values().filter(|g| g.colony_name == colony_name) {
            match graph.state {
                GraphState::Waiting => stats.waiting_graphs += 1,
                GraphState::Running => stats.running_graphs += 1,
                GraphState::Success => stats.successful_graphs += 1,
                GraphState::Failed => stats.failed_graphs += 1,
                GraphState::Cancelled => stats.cancelled_graphs += 1,
            }
        }
        Ok(stats)
    }

    async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<RetentionReport> {
        let mut state = self.state.write().await;
        let mut report = RetentionReport::default();

        let expired: Vec<Uuid> = state
            .graphs
            .values()
            .filter(|g| g.state.is_terminal() && g.end_time.is_some_and(|t| t < cutoff))
            .map(|g| g.id)
            .collect();
        for graph_id in expired {
            if let Some(graph) = state.graphs.remove(&graph_id) {
                for id in &graph.process_ids {
                    if state.processes.remove(id).is_some() {
                        report.processes_removed += 1;
                    }
                }
                report.graphs_removed += 1;
            }
        }

        let before = state.processes.len();
        state.processes.retain(|_, p| {
            !(p.process_graph_id.is_none()
                && p.is_terminal()
                && p.end_time.is_some_and(|t| t < cutoff))
        });
        report.processes_removed += before - state.processes.len();

        Ok(report)
    }
}
