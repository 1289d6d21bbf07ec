use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::Orchestrator;
use crate::error::{ColonyError, Result};
use crate::scheduler::graph::{plan_child_insertion, AddChildRequest};
use crate::scheduler::{FunctionSpec, Process, ProcessGraph, ProcessState, WorkflowSpec};

/// Attempts for an edit that keeps losing compare-and-set races.
const CAS_ATTEMPTS: usize = 16;

/// Overrides applied to root processes when a trigger instantiates a workflow.
#[derive(Debug, Clone, Default)]
pub struct RootOverrides {
    /// Replaces the args of every root process.
    pub args: Option<Vec<Value>>,
    /// Becomes the input of every root process.
    pub input: Vec<Value>,
}

impl Orchestrator {
    /// Submit a standalone process.
    pub async fn submit(&self, spec: FunctionSpec, initiator: &str) -> Result<Process> {
        spec.validate_standalone()?;
        let process = Process::new(spec, initiator);
        self.store.add_process(process.clone()).await?;

        tracing::info!(
            process_id = %process.id,
            colony = %process.colony_name(),
            func = %process.spec.func_name,
            "Process submitted"
        );
        self.wakeups
            .wake(process.colony_name(), process.executor_type())
            .await;
        Ok(process)
    }

    /// Validate a workflow and materialise it as a process graph.
    pub async fn submit_workflow(
        &self,
        workflow: WorkflowSpec,
        initiator: &str,
    ) -> Result<ProcessGraph> {
        self.create_process_graph(workflow, initiator, RootOverrides::default())
            .await
    }

    pub(crate) async fn create_process_graph(
        &self,
        workflow: WorkflowSpec,
        initiator: &str,
        overrides: RootOverrides,
    ) -> Result<ProcessGraph> {
        let order = workflow.validate()?;
        let now = Utc::now();
        let mut graph = ProcessGraph::new(&workflow.colony_name, initiator);
        graph.submission_time = now;

        let mut specs: HashMap<String, FunctionSpec> = workflow
            .function_specs
            .into_iter()
            .map(|spec| (spec.node_name.clone(), spec))
            .collect();

        let mut members: Vec<Process> = Vec::with_capacity(order.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        for name in &order {
            let mut spec = specs
                .remove(name)
                .ok_or_else(|| ColonyError::Internal(format!("node '{}' vanished", name)))?;
            spec.conditions.colony_name = workflow.colony_name.clone();

            let is_root = spec.conditions.dependencies.is_empty();
            if is_root {
                if let Some(args) = &overrides.args {
                    spec.args = args.clone();
                }
            }

            let mut process = Process::with_id(Uuid::new_v4(), spec, initiator, now);
            process.process_graph_id = Some(graph.id);
            process.wait_for_parents = !is_root;
            if is_root {
                process.input = overrides.input.clone();
            }
            index.insert(name.clone(), members.len());
            members.push(process);
        }

        // Topological order guarantees every dependency is already indexed.
        for child in 0..members.len() {
            let deps = members[child].spec.conditions.dependencies.clone();
            for dep in deps {
                let parent = *index
                    .get(&dep)
                    .ok_or_else(|| ColonyError::Internal(format!("node '{}' not indexed", dep)))?;
                let (parent_id, child_id) = (members[parent].id, members[child].id);
                members[child].parents.push(parent_id);
                members[parent].children.push(child_id);
            }
        }
        for process in &members {
            graph.add_member(process);
        }

        let roots: Vec<(String, String)> = members
            .iter()
            .filter(|p| p.parents.is_empty())
            .map(|p| (p.colony_name().to_string(), p.executor_type().to_string()))
            .collect();

        self.store
            .add_process_graph(graph.clone(), members)
            .await?;

        tracing::info!(
            graph_id = %graph.id,
            colony = %graph.colony_name,
            processes = graph.process_ids.len(),
            "Process graph submitted"
        );
        for (colony, executor_type) in roots {
            self.wakeups.wake(&colony, &executor_type).await;
        }
        Ok(graph)
    }

    /// Cancel every non-terminal member of a graph.
    pub async fn cancel_workflow(&self, graph_id: Uuid) -> Result<ProcessGraph> {
        let members = self.store.get_graph_members(graph_id).await?;
        let now = Utc::now();

        for process in members {
            self.cancel_until_terminal(process, now).await?;
        }

        let graph = self.store.refresh_process_graph(graph_id, now).await?;
        tracing::info!(graph_id = %graph_id, state = %graph.state, "Process graph cancelled");
        Ok(graph)
    }

    /// Cancel `process`, re-reading it whenever a concurrent transition wins.
    async fn cancel_until_terminal(&self, mut process: Process, now: DateTime<Utc>) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(transition) = process.plan_cancel(now) else {
                return Ok(());
            };
            match self.store.update_process_state(&transition).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(process_id = %process.id, "Process changed during cancel, retrying");
                    process = self.get_process(process.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ColonyError::Conflict(format!(
            "process {} kept changing while being cancelled",
            process.id
        )))
    }

    /// Attach a new node to a live graph. Re-plans against a fresh snapshot
    /// when a concurrent edit or state change wins the race.
    pub async fn add_child(&self, graph_id: Uuid, request: AddChildRequest) -> Result<Process> {
        let parent_id = request.parent_id;
        let mut attempt = 0;
        let process = loop {
            attempt += 1;
            let graph = self.get_process_graph(graph_id).await?;
            let members = self.store.get_graph_members(graph_id).await?;
            let insertion = plan_child_insertion(&graph, &members, request.clone())?;

            match self.store.insert_graph_member(graph_id, &insertion).await {
                Ok(()) => break insertion.process,
                Err(e) if e.is_conflict() && attempt < CAS_ATTEMPTS => {
                    tracing::debug!(graph_id = %graph_id, attempt, error = %e, "Graph changed during edit, re-planning");
                }
                Err(e) => return Err(e),
            }
        };
        self.store.refresh_process_graph(graph_id, Utc::now()).await?;

        tracing::info!(
            graph_id = %graph_id,
            parent_id = %parent_id,
            process_id = %process.id,
            node = %process.node_name(),
            "Process graph extended"
        );
        if !process.wait_for_parents {
            self.wakeups
                .wake(process.colony_name(), process.executor_type())
                .await;
        }
        Ok(process)
    }

    /// Propagate a member's terminal transition through its graph.
    pub(crate) async fn on_process_changed(&self, process: &Process) -> Result<()> {
        let Some(graph_id) = process.process_graph_id else {
            return Ok(());
        };

        match process.state {
            ProcessState::Success => self.release_children(process).await?,
            ProcessState::Failed | ProcessState::Cancelled => {
                self.cancel_descendants(process).await?
            }
            ProcessState::Waiting | ProcessState::Running => {}
        }

        let graph = self
            .store
            .refresh_process_graph(graph_id, Utc::now())
            .await?;
        if graph.state.is_terminal() {
            tracing::info!(graph_id = %graph_id, state = %graph.state, "Process graph finished");
        }
        Ok(())
    }

    /// Clear the gate on children whose parents have all succeeded.
    async fn release_children(&self, parent: &Process) -> Result<()> {
        for child_id in &parent.children {
            let Some(child) = self.store.get_process(*child_id).await? else {
                continue;
            };
            if child.state != ProcessState::Waiting || !child.wait_for_parents {
                continue;
            }

            let mut ready = true;
            for id in &child.parents {
                let succeeded = self
                    .store
                    .get_process(*id)
                    .await?
                    .is_some_and(|p| p.state == ProcessState::Success);
                if !succeeded {
                    ready = false;
                    break;
                }
            }
            if !ready {
                continue;
            }

            self.store.set_wait_for_parents(child.id, false).await?;
            tracing::debug!(process_id = %child.id, "Dependencies satisfied");
            self.wakeups
                .wake(child.colony_name(), child.executor_type())
                .await;
        }
        Ok(())
    }

    /// Cancel every WAITING process downstream of `origin`.
    async fn cancel_descendants(&self, origin: &Process) -> Result<()> {
        let now = Utc::now();
        let mut queue: VecDeque<Uuid> = origin.children.iter().copied().collect();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut cancelled = 0usize;

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(process) = self.store.get_process(id).await? else {
                continue;
            };
            queue.extend(process.children.iter().copied());

            if process.state != ProcessState::Waiting {
                continue;
            }
            let Some(transition) = process.plan_cancel(now) else {
                continue;
            };
            match self.store.update_process_state(&transition).await {
                Ok(_) => cancelled += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(process_id = %id, "Process changed during cascade, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if cancelled > 0 {
            tracing::info!(
                process_id = %origin.id,
                state = %origin.state,
                cancelled,
                "Cancelled dependent processes"
            );
        }
        Ok(())
    }
}
