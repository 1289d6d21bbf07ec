use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ColonyError, Result};
use crate::scheduler::process::{Process, ProcessState};
use crate::scheduler::spec::FunctionSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphState {
    Waiting,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl GraphState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GraphState::Success | GraphState::Failed | GraphState::Cancelled
        )
    }
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphState::Waiting => write!(f, "waiting"),
            GraphState::Running => write!(f, "running"),
            GraphState::Success => write!(f, "success"),
            GraphState::Failed => write!(f, "failed"),
            GraphState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregate state of a graph from its members' states.
pub fn derive_state<I>(states: I) -> GraphState
where
    I: IntoIterator<Item = ProcessState>,
{
    let (mut total, mut success, mut active) = (0usize, 0usize, 0usize);
    let mut cancelled = false;

    for state in states {
        total += 1;
        match state {
            ProcessState::Failed => return GraphState::Failed,
            ProcessState::Cancelled => cancelled = true,
            ProcessState::Success => success += 1,
            ProcessState::Running => active += 1,
            ProcessState::Waiting => {}
        }
    }

    if cancelled {
        GraphState::Cancelled
    } else if total > 0 && success == total {
        GraphState::Success
    } else if success > 0 || active > 0 {
        GraphState::Running
    } else {
        GraphState::Waiting
    }
}

/// Topological order of a dependency map (node -> nodes it depends on).
pub fn topological_order(dependencies: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in dependencies.keys() {
        graph.add_node(name.as_str());
    }
    for (name, deps) in dependencies {
        for dep in deps {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(ColonyError::Validation(format!(
            "cycle detected in workflow involving node '{}'",
            cycle.node_id()
        ))),
    }
}

/// A materialised workflow. Edges live on the member processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub id: Uuid,
    pub colony_name: String,
    pub initiator: String,
    pub state: GraphState,
    pub submission_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub process_ids: Vec<Uuid>,
    pub roots: Vec<Uuid>,
    /// Node name to process id.
    pub nodes: BTreeMap<String, Uuid>,
}

impl ProcessGraph {
    pub fn new(colony_name: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            colony_name: colony_name.into(),
            initiator: initiator.into(),
            state: GraphState::Waiting,
            submission_time: Utc::now(),
            start_time: None,
            end_time: None,
            process_ids: Vec::new(),
            roots: Vec::new(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn add_member(&mut self, process: &Process) {
        self.process_ids.push(process.id);
        self.nodes.insert(process.node_name().to_string(), process.id);
        if process.parents.is_empty() {
            self.roots.push(process.id);
        }
    }

    /// Recompute the aggregate state. Returns true if anything changed.
    pub fn refresh(&mut self, members: &[Process], now: DateTime<Utc>) -> bool {
        let state = derive_state(members.iter().map(|p| p.state));
        if state == self.state {
            return false;
        }
        if self.start_time.is_none() && state != GraphState::Waiting {
            self.start_time = Some(now);
        }
        self.end_time = state.is_terminal().then_some(now);
        self.state = state;
        true
    }

    /// Members nothing in the graph depends on.
    pub fn leaves<'a>(&self, members: &'a [Process]) -> Vec<&'a Process> {
        members
            .iter()
            .filter(|p| p.process_graph_id == Some(self.id) && p.children.is_empty())
            .collect()
    }
}

/// New relation lists for an existing member after a graph edit, applied
/// only if the member still has the state and relations it was planned from.
#[derive(Debug, Clone, PartialEq)]
pub struct Relink {
    pub process_id: Uuid,
    pub expected_state: ProcessState,
    pub expected_parents: Vec<Uuid>,
    pub expected_children: Vec<Uuid>,
    pub parents: Vec<Uuid>,
    pub children: Vec<Uuid>,
    /// `None` leaves the gate as it is.
    pub wait_for_parents: Option<bool>,
}

impl Relink {
    /// A relink of `process` that, as planned, changes nothing.
    fn of(process: &Process) -> Self {
        Self {
            process_id: process.id,
            expected_state: process.state,
            expected_parents: process.parents.clone(),
            expected_children: process.children.clone(),
            parents: process.parents.clone(),
            children: process.children.clone(),
            wait_for_parents: None,
        }
    }

    pub fn matches(&self, process: &Process) -> bool {
        process.state == self.expected_state
            && process.parents == self.expected_parents
            && process.children == self.expected_children
    }
}

/// A validated dynamic extension of a running graph.
#[derive(Debug, Clone)]
pub struct ChildInsertion {
    pub process: Process,
    pub relinks: Vec<Relink>,
}

/// Request to attach a new node to an existing graph.
#[derive(Debug, Clone)]
pub struct AddChildRequest {
    pub parent_id: Uuid,
    /// Existing un-started member the new node should feed.
    pub child_id: Option<Uuid>,
    pub spec: FunctionSpec,
    /// Splice the new node between the parent and all of its children.
    pub insert: bool,
    pub initiator: String,
}

/// Validate and plan an `AddChildRequest` against a snapshot of the graph.
pub fn plan_child_insertion(
    graph: &ProcessGraph,
    members: &[Process],
    request: AddChildRequest,
) -> Result<ChildInsertion> {
    if graph.state.is_terminal() {
        return Err(ColonyError::Validation(format!(
            "process graph {} is already {}",
            graph.id, graph.state
        )));
    }

    let by_id: HashMap<Uuid, &Process> = members.iter().map(|p| (p.id, p)).collect();
    let parent = by_id
        .get(&request.parent_id)
        .copied()
        .ok_or(ColonyError::ProcessNotFound(request.parent_id))?;
    if parent.process_graph_id != Some(graph.id) {
        return Err(ColonyError::Validation(format!(
            "process {} is not a member of graph {}",
            parent.id, graph.id
        )));
    }
    if matches!(parent.state, ProcessState::Failed | ProcessState::Cancelled) {
        return Err(ColonyError::Validation(format!(
            "parent {} is {} and can never succeed",
            parent.id, parent.state
        )));
    }

    let mut spec = request.spec;
    spec.conditions.colony_name = graph.colony_name.clone();
    spec.conditions.dependencies = vec![parent.node_name().to_string()];
    if spec.node_name.trim().is_empty() {
        return Err(ColonyError::Validation(
            "new node must have a node name".to_string(),
        ));
    }
    spec.validate_common()?;
    if graph.nodes.contains_key(&spec.node_name) {
        return Err(ColonyError::Validation(format!(
            "duplicate node name '{}'",
            spec.node_name
        )));
    }

    let mut process = Process::new(spec, request.initiator);
    process.process_graph_id = Some(graph.id);
    process.parents = vec![parent.id];
    process.wait_for_parents = parent.state != ProcessState::Success;

    let mut relinks = Vec::new();
    if request.insert {
        for child_id in &parent.children {
            let child = unstarted_member(&by_id, *child_id)?;
            let parents = child
                .parents
                .iter()
                .map(|id| if *id == parent.id { process.id } else { *id })
                .collect();
            relinks.push(Relink {
                parents,
                wait_for_parents: Some(true),
                ..Relink::of(child)
            });
        }
        process.children = parent.children.clone();
        relinks.push(Relink {
            children: vec![process.id],
            ..Relink::of(parent)
        });
    } else {
        if let Some(child_id) = request.child_id {
            let child = unstarted_member(&by_id, child_id)?;
            let mut parents = child.parents.clone();
            parents.push(process.id);
            relinks.push(Relink {
                parents,
                wait_for_parents: Some(true),
                ..Relink::of(child)
            });
            process.children = vec![child.id];
        }
        let mut children = parent.children.clone();
        children.push(process.id);
        relinks.push(Relink {
            children,
            ..Relink::of(parent)
        });
    }

    check_acyclic(members, &process, &relinks)?;

    Ok(ChildInsertion { process, relinks })
}

fn unstarted_member<'a>(by_id: &HashMap<Uuid, &'a Process>, id: Uuid) -> Result<&'a Process> {
    let p = by_id
        .get(&id)
        .copied()
        .ok_or(ColonyError::ProcessNotFound(id))?;
    if p.state != ProcessState::Waiting {
        return Err(ColonyError::Validation(format!(
            "process {} has already started and cannot gain a parent",
            id
        )));
    }
    Ok(p)
}

fn check_acyclic(members: &[Process], added: &Process, relinks: &[Relink]) -> Result<()> {
    let mut names: HashMap<Uuid, &str> = members.iter().map(|p| (p.id, p.node_name())).collect();
    names.insert(added.id, added.node_name());

    let relinked: HashMap<Uuid, &Relink> = relinks.iter().map(|r| (r.process_id, r)).collect();
    let parents_of = |p: &Process| -> Vec<Uuid> {
        relinked
            .get(&p.id)
            .map(|r| r.parents.clone())
            .unwrap_or_else(|| p.parents.clone())
    };

    let mut dependencies = BTreeMap::new();
    for p in members.iter().chain(std::iter::once(added)) {
        let deps = parents_of(p)
            .into_iter()
            .filter_map(|id| names.get(&id).map(|n| n.to_string()))
            .collect();
        dependencies.insert(p.node_name().to_string(), deps);
    }

    topological_order(&dependencies).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessState::*;

    #[test]
    fn aggregate_follows_members() {
        assert_eq!(derive_state([Waiting, Waiting]), GraphState::Waiting);
        assert_eq!(derive_state([Running, Waiting]), GraphState::Running);
        assert_eq!(derive_state([Success, Waiting]), GraphState::Running);
        assert_eq!(derive_state([Success, Success]), GraphState::Success);
        assert_eq!(derive_state([Success, Cancelled]), GraphState::Cancelled);
        assert_eq!(derive_state([Cancelled, Failed]), GraphState::Failed);
        assert_eq!(derive_state([Running, Failed]), GraphState::Failed);
    }

    #[test]
    fn refresh_sets_times() {
        let mut graph = ProcessGraph::new("dev", "tester");
        let mut p = Process::new(FunctionSpec::new("f", "dev", "cli"), "tester");
        p.state = Running;
        let now = Utc::now();
        assert!(graph.refresh(std::slice::from_ref(&p), now));
        assert_eq!(graph.start_time, Some(now));
        assert!(graph.end_time.is_none());

        p.state = Success;
        assert!(graph.refresh(std::slice::from_ref(&p), now));
        assert_eq!(graph.state, GraphState::Success);
        assert_eq!(graph.end_time, Some(now));
        assert!(!graph.refresh(std::slice::from_ref(&p), now));
    }

    #[test]
    fn topological_order_detects_cycles() {
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), vec!["c".to_string()]);
        deps.insert("b".to_string(), vec!["a".to_string()]);
        deps.insert("c".to_string(), vec!["b".to_string()]);
        assert!(topological_order(&deps).is_err());

        deps.insert("a".to_string(), vec![]);
        assert_eq!(
            topological_order(&deps).unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
