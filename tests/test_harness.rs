//! Test harness for orchestrator integration tests.
//!
//! Provides an in-memory orchestrator with short timings plus helpers for
//! registering executors, leasing work and polling for conditions.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use colony_lite::config::SchedulerConfig;
use colony_lite::scheduler::{Executor, FunctionSpec, Process, WorkflowSpec};
use colony_lite::store::MemoryStore;
use colony_lite::{Orchestrator, Result};

pub const COLONY: &str = "dev";
pub const EXECUTOR_TYPE: &str = "cli";

/// Scheduler config with short periods for faster tests
pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        generator_checker_period_ms: 20,
        cron_checker_period_ms: 20,
        deadline_sweep_period_ms: 20,
        assign_poll_interval_ms: 20,
        default_assign_timeout_secs: 1,
        ..SchedulerConfig::default()
    }
}

pub fn test_orchestrator() -> Arc<Orchestrator> {
    test_orchestrator_with(test_scheduler_config())
}

pub fn test_orchestrator_with(config: SchedulerConfig) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(Arc::new(MemoryStore::new()), config))
}

/// Function spec in the default colony for the default executor type
pub fn spec(func_name: &str) -> FunctionSpec {
    FunctionSpec::new(func_name, COLONY, EXECUTOR_TYPE)
}

pub fn node(name: &str) -> FunctionSpec {
    spec(name).with_node_name(name)
}

/// `task1 -> task2`
pub fn two_step_workflow() -> WorkflowSpec {
    WorkflowSpec::new(COLONY)
        .with_function(node("task1"))
        .with_function(node("task2").with_dependency("task1"))
}

/// `a -> {b, c} -> d`
pub fn diamond_workflow() -> WorkflowSpec {
    WorkflowSpec::new(COLONY)
        .with_function(node("a"))
        .with_function(node("b").with_dependency("a"))
        .with_function(node("c").with_dependency("a"))
        .with_function(node("d").with_dependency("b").with_dependency("c"))
}

pub async fn register(orchestrator: &Orchestrator, name: &str) -> Executor {
    orchestrator
        .add_executor(Executor::new(name, EXECUTOR_TYPE, COLONY))
        .await
        .unwrap()
}

/// Assign with a short timeout
pub async fn try_assign(orchestrator: &Orchestrator, executor_name: &str) -> Result<Process> {
    orchestrator
        .assign(
            COLONY,
            executor_name,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
}

pub async fn assign(orchestrator: &Orchestrator, executor_name: &str) -> Process {
    try_assign(orchestrator, executor_name).await.unwrap()
}

/// Find a graph member by node name
pub async fn member(orchestrator: &Orchestrator, graph_id: uuid::Uuid, name: &str) -> Process {
    orchestrator
        .store()
        .get_graph_members(graph_id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.node_name() == name)
        .unwrap()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
