mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use colony_lite::scheduler::{Executor, Process, ProcessState};
use colony_lite::worker::{ExecutorLoop, FunctionHandler, LeaseHeartbeat, ShellHandler};
use test_harness::{
    assert_eventually, assign, register, spec, test_orchestrator, COLONY, EXECUTOR_TYPE,
};

/// Build an unassigned process for `func_name` with the given args
fn shell_process(func_name: &str, args: Vec<Value>) -> Process {
    Process::new(spec(func_name).with_args(args), "tester")
}

fn shell_loop(orchestrator: Arc<colony_lite::Orchestrator>, name: &str) -> ExecutorLoop {
    ExecutorLoop::new(
        orchestrator,
        Executor::new(name, EXECUTOR_TYPE, COLONY),
        Arc::new(ShellHandler::new()),
    )
    .with_assign_timeout(Duration::from_millis(100))
}

#[tokio::test]
async fn test_execute_simple_command() {
    let process = shell_process("echo hello", vec![]);
    let output = ShellHandler::new().handle(&process).await.unwrap();
    assert_eq!(output, vec![json!("hello\n")]);
}

#[tokio::test]
async fn test_execute_empty_output() {
    // Command that produces no output
    let process = shell_process("true", vec![]);
    let output = ShellHandler::new().handle(&process).await.unwrap();
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let process = shell_process("seq 1 1000", vec![]);
    let output = ShellHandler::new().handle(&process).await.unwrap();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].as_str().unwrap().lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let process = shell_process("exit 3", vec![]);
    let error = ShellHandler::new().handle(&process).await.unwrap_err();
    assert!(error.contains("3"));
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let process = shell_process("echo 'error message' >&2 && exit 1", vec![]);
    let error = ShellHandler::new().handle(&process).await.unwrap_err();
    assert!(error.contains("error message"));
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let process = shell_process("nonexistent_command_xyz_123", vec![]);
    assert!(ShellHandler::new().handle(&process).await.is_err());
}

#[tokio::test]
async fn test_execute_piped_command() {
    let process = shell_process("echo 'hello world' | tr 'a-z' 'A-Z'", vec![]);
    let output = ShellHandler::new().handle(&process).await.unwrap();
    assert_eq!(output, vec![json!("HELLO WORLD\n")]);
}

#[test]
fn test_command_line_stringifies_args() {
    let process = shell_process("echo", vec![json!("plain"), json!(42), json!({"k": 1})]);
    assert_eq!(
        ShellHandler::command_line(&process),
        r#"echo plain 42 {"k":1}"#
    );
}

#[tokio::test]
async fn test_input_and_env_are_exposed() {
    let mut process = shell_process("echo \"$COLONY_INPUT $GREETING\"", vec![]);
    process.input = vec![json!("from-parent")];
    process
        .spec
        .env
        .insert("GREETING".to_string(), "hi".to_string());

    let output = ShellHandler::new().handle(&process).await.unwrap();
    assert_eq!(output, vec![json!("[\"from-parent\"] hi\n")]);
}

#[tokio::test]
async fn test_run_once_closes_on_success() {
    let orch = test_orchestrator();
    let executor = shell_loop(orch.clone(), "shell-1");
    executor.register().await.unwrap();
    let submitted = orch.submit(spec("echo done"), "tester").await.unwrap();

    let process = executor.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(process.id, submitted.id);
    assert_eq!(process.state, ProcessState::Success);
    assert_eq!(orch.get_process(submitted.id).await.unwrap().output, vec![json!("done\n")]);
}

#[tokio::test]
async fn test_run_once_requeues_then_fails() {
    let orch = test_orchestrator();
    let executor = shell_loop(orch.clone(), "shell-1");
    executor.register().await.unwrap();
    orch.submit(spec("exit 3").with_max_retries(1), "tester")
        .await
        .unwrap();

    let first = executor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.state, ProcessState::Waiting);
    assert_eq!(first.retries, 1);

    let second = executor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.state, ProcessState::Failed);
    assert!(!second.errors.is_empty());
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let orch = test_orchestrator();
    let executor = shell_loop(orch.clone(), "shell-1");
    executor.register().await.unwrap();
    executor.register().await.unwrap();
    assert_eq!(orch.list_executors(COLONY).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let orch = test_orchestrator();
    for i in 0..3 {
        orch.submit(spec(&format!("echo {}", i)), "tester")
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let executor = shell_loop(orch.clone(), "shell-1");
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { executor.run(shutdown).await }
    });

    assert_eventually(
        || {
            let orch = orch.clone();
            async move {
                orch.colony_statistics(COLONY)
                    .await
                    .map(|s| s.successful_processes == 3)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "all processes should succeed",
    )
    .await;

    shutdown.cancel();
    let executed = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("executor loop did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(executed, 3);
}

#[tokio::test]
async fn test_heartbeat_renews_lease() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    orch.submit(spec("work").with_max_exec_time(10), "tester")
        .await
        .unwrap();
    let process = assign(&orch, "execA").await;
    let first_deadline = process.exec_deadline.unwrap();
    let process_id = process.id;

    let stop = CancellationToken::new();
    let heartbeat = tokio::spawn({
        let orch = orch.clone();
        let stop = stop.clone();
        async move {
            LeaseHeartbeat::new(Duration::from_millis(30))
                .run(&orch, process_id, "execA", stop)
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.cancel();
    let renewals = heartbeat.await.unwrap();

    assert!(renewals >= 2, "expected several renewals, got {}", renewals);
    let renewed = orch.get_process(process_id).await.unwrap();
    assert!(renewed.exec_deadline.unwrap() > first_deadline);
}

#[tokio::test]
async fn test_heartbeat_stops_when_lease_is_lost() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    orch.submit(spec("work"), "tester").await.unwrap();
    let process = assign(&orch, "execA").await;
    orch.close(process.id, "execA", vec![]).await.unwrap();

    let renewals = tokio::time::timeout(
        Duration::from_secs(2),
        LeaseHeartbeat::new(Duration::from_millis(20)).run(
            &orch,
            process.id,
            "execA",
            CancellationToken::new(),
        ),
    )
    .await
    .expect("heartbeat kept running after the lease ended");
    assert_eq!(renewals, 0);
}

#[tokio::test]
async fn test_heartbeat_keeps_long_process_alive() {
    let orch = test_orchestrator();
    let shutdown = CancellationToken::new();
    let _background = orch.spawn_background(shutdown.clone());

    let executor = shell_loop(orch.clone(), "shell-1").with_heartbeat(Duration::from_millis(200));
    executor.register().await.unwrap();
    let submitted = orch
        .submit(spec("sleep 2").with_max_exec_time(1), "tester")
        .await
        .unwrap();

    let process = executor.run_once(&CancellationToken::new()).await.unwrap();
    shutdown.cancel();

    assert_eq!(process.id, submitted.id);
    assert_eq!(process.state, ProcessState::Success);
    assert_eq!(process.retries, 0);
}
