use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chrono::{DateTime, Duration, Utc};

use crate::error::{ColonyError, Result};
use crate::scheduler::graph::topological_order;

/// Upper bound for every configurable duration: wait and exec limits,
/// generator timeouts and cron intervals.
pub const MAX_DURATION_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// `from + seconds`, or `None` if the result is not representable.
pub fn seconds_after(from: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(seconds).and_then(|offset| from.checked_add_signed(offset))
}

/// Reject durations above [`MAX_DURATION_SECS`].
pub(crate) fn check_duration(owner: &str, field: &str, seconds: i64) -> Result<()> {
    if seconds > MAX_DURATION_SECS {
        return Err(ColonyError::Validation(format!(
            "{} {} of {}s exceeds the maximum of {}s",
            owner, field, seconds, MAX_DURATION_SECS
        )));
    }
    Ok(())
}

/// Placement conditions attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conditions {
    pub colony_name: String,
    /// When non-empty, only these executors may run the process.
    pub executor_names: Vec<String>,
    pub executor_type: String,
    /// Node names this process waits on. Only meaningful inside a workflow.
    pub dependencies: Vec<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub gpus: Option<u32>,
    pub nodes: Option<u32>,
}

/// Immutable submission template for a single process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionSpec {
    pub node_name: String,
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub env: HashMap<String, String>,
    pub conditions: Conditions,
    /// Seconds a process may wait unassigned. `<= 0` disables the limit.
    pub max_wait_time: i64,
    /// Seconds a lease may run. `<= 0` disables the limit.
    pub max_exec_time: i64,
    /// Negative means unlimited retries.
    pub max_retries: i32,
    pub priority: i32,
    pub label: Option<String>,
    pub resource: Option<Value>,
}

impl Default for FunctionSpec {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            func_name: String::new(),
            args: Vec::new(),
            kwargs: Map::new(),
            env: HashMap::new(),
            conditions: Conditions::default(),
            max_wait_time: -1,
            max_exec_time: -1,
            max_retries: 0,
            priority: 0,
            label: None,
            resource: None,
        }
    }
}

impl FunctionSpec {
    pub fn new(
        func_name: impl Into<String>,
        colony_name: impl Into<String>,
        executor_type: impl Into<String>,
    ) -> Self {
        Self {
            func_name: func_name.into(),
            conditions: Conditions {
                colony_name: colony_name.into(),
                executor_type: executor_type.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_dependency(mut self, node_name: impl Into<String>) -> Self {
        self.conditions.dependencies.push(node_name.into());
        self
    }

    pub fn with_target(mut self, executor_name: impl Into<String>) -> Self {
        self.conditions.executor_names.push(executor_name.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_exec_time(mut self, seconds: i64) -> Self {
        self.max_exec_time = seconds;
        self
    }

    pub fn with_max_wait_time(mut self, seconds: i64) -> Self {
        self.max_wait_time = seconds;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn colony_name(&self) -> &str {
        &self.conditions.colony_name
    }

    pub fn executor_type(&self) -> &str {
        &self.conditions.executor_type
    }

    pub fn is_targeted(&self) -> bool {
        !self.conditions.executor_names.is_empty()
    }

    pub fn retries_unlimited(&self) -> bool {
        self.max_retries < 0
    }

    pub(crate) fn validate_common(&self) -> Result<()> {
        if self.func_name.trim().is_empty() {
            return Err(ColonyError::Validation(
                "function spec must name a function".to_string(),
            ));
        }
        if self.conditions.executor_type.trim().is_empty() {
            return Err(ColonyError::Validation(format!(
                "function '{}' must name an executor type",
                self.func_name
            )));
        }
        let owner = format!("function '{}'", self.func_name);
        check_duration(&owner, "max_wait_time", self.max_wait_time)?;
        check_duration(&owner, "max_exec_time", self.max_exec_time)?;
        Ok(())
    }

    /// Validate a spec submitted on its own, outside any workflow.
    pub fn validate_standalone(&self) -> Result<()> {
        self.validate_common()?;
        if self.conditions.colony_name.trim().is_empty() {
            return Err(ColonyError::Validation(format!(
                "function '{}' must name a colony",
                self.func_name
            )));
        }
        if !self.conditions.dependencies.is_empty() {
            return Err(ColonyError::Validation(format!(
                "function '{}' declares dependencies outside a workflow",
                self.func_name
            )));
        }
        Ok(())
    }
}

/// Template for a DAG of processes. Dependencies refer to node names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSpec {
    pub colony_name: String,
    pub function_specs: Vec<FunctionSpec>,
}

impl WorkflowSpec {
    pub fn new(colony_name: impl Into<String>) -> Self {
        Self {
            colony_name: colony_name.into(),
            function_specs: Vec::new(),
        }
    }

    pub fn with_function(mut self, spec: FunctionSpec) -> Self {
        self.function_specs.push(spec);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a workflow from a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate the workflow and return its node names in dependency order.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.colony_name.trim().is_empty() {
            return Err(ColonyError::Validation(
                "workflow must name a colony".to_string(),
            ));
        }
        if self.function_specs.is_empty() {
            return Err(ColonyError::Validation(
                "workflow must contain at least one function spec".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.function_specs {
            spec.validate_common()?;
            if spec.node_name.trim().is_empty() {
                return Err(ColonyError::Validation(format!(
                    "function '{}' in a workflow must have a node name",
                    spec.func_name
                )));
            }
            if !seen.insert(spec.node_name.as_str()) {
                return Err(ColonyError::Validation(format!(
                    "duplicate node name '{}'",
                    spec.node_name
                )));
            }
        }

        for spec in &self.function_specs {
            for dep in &spec.conditions.dependencies {
                if dep == &spec.node_name {
                    return Err(ColonyError::Validation(format!(
                        "node '{}' cannot depend on itself",
                        spec.node_name
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(ColonyError::Validation(format!(
                        "node '{}' has unknown dependency '{}'",
                        spec.node_name, dep
                    )));
                }
            }
        }

        topological_order(&self.dependency_map())
    }

    /// Node name to the node names it depends on.
    pub fn dependency_map(&self) -> BTreeMap<String, Vec<String>> {
        self.function_specs
            .iter()
            .map(|spec| {
                (
                    spec.node_name.clone(),
                    spec.conditions.dependencies.clone(),
                )
            })
            .collect()
    }

    /// Node names with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.function_specs
            .iter()
            .filter(|spec| spec.conditions.dependencies.is_empty())
            .map(|spec| spec.node_name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> FunctionSpec {
        FunctionSpec::new("echo", "dev", "cli").with_node_name(name)
    }

    #[test]
    fn function_spec_defaults_disable_limits() {
        let spec = FunctionSpec::default();
        assert_eq!(spec.max_wait_time, -1);
        assert_eq!(spec.max_exec_time, -1);
        assert_eq!(spec.max_retries, 0);
        assert!(!spec.is_targeted());
    }

    #[test]
    fn standalone_rejects_dependencies() {
        let spec = FunctionSpec::new("echo", "dev", "cli").with_dependency("a");
        assert!(matches!(
            spec.validate_standalone(),
            Err(ColonyError::Validation(_))
        ));
    }

    #[test]
    fn standalone_requires_colony() {
        let spec = FunctionSpec::new("echo", "", "cli");
        assert!(spec.validate_standalone().is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let spec = FunctionSpec::new("echo", "dev", "cli").with_max_exec_time(i64::MAX);
        assert!(matches!(
            spec.validate_standalone(),
            Err(ColonyError::Validation(_))
        ));

        let spec = FunctionSpec::new("echo", "dev", "cli").with_max_wait_time(MAX_DURATION_SECS + 1);
        assert!(spec.validate_standalone().is_err());

        let spec = FunctionSpec::new("echo", "dev", "cli").with_max_wait_time(MAX_DURATION_SECS);
        assert!(spec.validate_standalone().is_ok());
    }

    #[test]
    fn seconds_after_saturates_to_none() {
        let now = Utc::now();
        assert_eq!(seconds_after(now, 5), Some(now + Duration::seconds(5)));
        assert!(seconds_after(now, i64::MAX).is_none());
        assert!(seconds_after(now, i64::MAX / 2).is_none());
    }

    #[test]
    fn workflow_order_respects_dependencies() {
        let wf = WorkflowSpec::new("dev")
            .with_function(node("task2").with_dependency("task1"))
            .with_function(node("task1"));
        let order = wf.validate().unwrap();
        assert_eq!(order, vec!["task1".to_string(), "task2".to_string()]);
        assert_eq!(wf.roots(), vec!["task1"]);
    }

    #[test]
    fn workflow_rejects_unknown_dependency() {
        let wf = WorkflowSpec::new("dev").with_function(node("a").with_dependency("missing"));
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("unknown dependency"));
    }

    #[test]
    fn workflow_rejects_cycle() {
        let wf = WorkflowSpec::new("dev")
            .with_function(node("a").with_dependency("b"))
            .with_function(node("b").with_dependency("a"));
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn workflow_rejects_duplicate_and_empty_names() {
        let dup = WorkflowSpec::new("dev")
            .with_function(node("a"))
            .with_function(node("a"));
        assert!(dup.validate().is_err());

        let unnamed = WorkflowSpec::new("dev").with_function(FunctionSpec::new("echo", "dev", "cli"));
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn workflow_json_roundtrip_keeps_dependencies() {
        let json = r#"{
            "colony_name": "dev",
            "function_specs": [
                {"node_name": "a", "func_name": "echo", "conditions": {"executor_type": "cli"}},
                {"node_name": "b", "func_name": "echo",
                 "conditions": {"executor_type": "cli", "dependencies": ["a"]}}
            ]
        }"#;
        let wf = WorkflowSpec::from_json(json).unwrap();
        assert_eq!(wf.function_specs[1].conditions.dependencies, vec!["a"]);
        assert_eq!(wf.function_specs[0].max_exec_time, -1);
        assert_eq!(wf.validate().unwrap().len(), 2);
    }
}
