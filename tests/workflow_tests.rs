mod test_harness;

use futures::future::join_all;
use serde_json::json;

use colony_lite::scheduler::graph::{plan_child_insertion, AddChildRequest};
use colony_lite::scheduler::{GraphState, ProcessState, WorkflowSpec};
use colony_lite::ColonyError;
use test_harness::{
    assign, diamond_workflow, member, node, register, spec, test_orchestrator, try_assign,
    two_step_workflow, COLONY,
};

fn add_child(parent_id: uuid::Uuid, name: &str) -> AddChildRequest {
    AddChildRequest {
        parent_id,
        child_id: None,
        spec: spec("echo").with_node_name(name),
        insert: false,
        initiator: "tester".to_string(),
    }
}

/// `task2` is never handed out before `task1` succeeds, and receives its output.
#[tokio::test]
async fn test_dependency_gating() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    register(&orch, "execB").await;

    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    assert_eq!(graph.state, GraphState::Waiting);
    assert_eq!(graph.process_ids.len(), 2);
    assert_eq!(graph.roots.len(), 1);

    let task2 = member(&orch, graph.id, "task2").await;
    assert!(task2.wait_for_parents);

    let task1 = assign(&orch, "execA").await;
    assert_eq!(task1.node_name(), "task1");
    assert!(try_assign(&orch, "execB").await.unwrap_err().is_no_work());
    assert_eq!(
        orch.get_process_graph(graph.id).await.unwrap().state,
        GraphState::Running
    );

    orch.close(task1.id, "execA", vec![json!("from task1")]).await.unwrap();

    let task2 = assign(&orch, "execB").await;
    assert_eq!(task2.node_name(), "task2");
    assert_eq!(task2.input, vec![json!("from task1")]);

    orch.close(task2.id, "execB", vec![]).await.unwrap();
    let graph = orch.get_process_graph(graph.id).await.unwrap();
    assert_eq!(graph.state, GraphState::Success);
    assert!(graph.start_time.is_some());
    assert!(graph.end_time.is_some());
}

/// Terminal failure of `task1` cascades: `task2` is cancelled rather than
/// left waiting forever.
#[tokio::test]
async fn test_failure_cascades_to_dependents() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;

    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;
    orch.fail(task1.id, "execA", vec!["boom".to_string()]).await.unwrap();

    let task1 = member(&orch, graph.id, "task1").await;
    let task2 = member(&orch, graph.id, "task2").await;
    assert_eq!(task1.state, ProcessState::Failed);
    assert_eq!(task2.state, ProcessState::Cancelled);

    let graph = orch.get_process_graph(graph.id).await.unwrap();
    assert_eq!(graph.state, GraphState::Failed);
    assert!(graph.end_time.is_some());
    assert!(try_assign(&orch, "execA").await.unwrap_err().is_no_work());
}

#[tokio::test]
async fn test_failure_leaves_independent_branch_running() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;

    let wf = WorkflowSpec::new(COLONY)
        .with_function(node("a").with_target("execA"))
        .with_function(node("b"))
        .with_function(node("c").with_dependency("a"));
    let graph = orch.submit_workflow(wf, "tester").await.unwrap();

    let a = assign(&orch, "execA").await;
    assert_eq!(a.node_name(), "a");
    orch.fail(a.id, "execA", vec!["boom".to_string()]).await.unwrap();

    assert_eq!(member(&orch, graph.id, "c").await.state, ProcessState::Cancelled);
    let b = assign(&orch, "execA").await;
    assert_eq!(b.node_name(), "b");
    assert_eq!(
        orch.get_process_graph(graph.id).await.unwrap().state,
        GraphState::Failed
    );
}

#[tokio::test]
async fn test_diamond_joins_parent_outputs() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;

    let graph = orch
        .submit_workflow(diamond_workflow(), "tester")
        .await
        .unwrap();

    let a = assign(&orch, "execA").await;
    orch.close(a.id, "execA", vec![json!(1)]).await.unwrap();

    let first = assign(&orch, "execA").await;
    let second = assign(&orch, "execA").await;
    let mut names = vec![first.node_name().to_string(), second.node_name().to_string()];
    names.sort();
    assert_eq!(names, vec!["b", "c"]);
    assert_eq!(first.input, vec![json!(1)]);

    orch.close(first.id, "execA", vec![json!(first.node_name())]).await.unwrap();
    assert!(try_assign(&orch, "execA").await.unwrap_err().is_no_work());
    orch.close(second.id, "execA", vec![json!(second.node_name())]).await.unwrap();

    let d = assign(&orch, "execA").await;
    assert_eq!(d.node_name(), "d");
    let mut input: Vec<String> = d
        .input
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    input.sort();
    assert_eq!(input, vec!["b", "c"]);

    orch.close(d.id, "execA", vec![]).await.unwrap();
    assert_eq!(
        orch.get_process_graph(graph.id).await.unwrap().state,
        GraphState::Success
    );
}

#[tokio::test]
async fn test_cancel_process_cascades() {
    let orch = test_orchestrator();
    let graph = orch
        .submit_workflow(diamond_workflow(), "tester")
        .await
        .unwrap();
    let b = member(&orch, graph.id, "b").await;

    orch.cancel(b.id).await.unwrap();

    assert_eq!(member(&orch, graph.id, "b").await.state, ProcessState::Cancelled);
    assert_eq!(member(&orch, graph.id, "d").await.state, ProcessState::Cancelled);
    assert_eq!(member(&orch, graph.id, "a").await.state, ProcessState::Waiting);
    assert_eq!(member(&orch, graph.id, "c").await.state, ProcessState::Waiting);
    assert_eq!(
        orch.get_process_graph(graph.id).await.unwrap().state,
        GraphState::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_workflow() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(diamond_workflow(), "tester")
        .await
        .unwrap();
    let a = assign(&orch, "execA").await;

    let graph = orch.cancel_workflow(graph.id).await.unwrap();
    assert_eq!(graph.state, GraphState::Cancelled);
    for p in orch.store().get_graph_members(graph.id).await.unwrap() {
        assert_eq!(p.state, ProcessState::Cancelled);
    }

    // A late close from the old lease holder changes nothing
    let closed = orch.close(a.id, "execA", vec![json!("late")]).await.unwrap();
    assert_eq!(closed.state, ProcessState::Cancelled);
}

#[tokio::test]
async fn test_standalone_submit_rejects_dependencies() {
    let orch = test_orchestrator();
    let err = orch
        .submit(spec("echo").with_dependency("a"), "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, ColonyError::Validation(_)));
}

#[tokio::test]
async fn test_submit_workflow_rejects_cycle() {
    let orch = test_orchestrator();
    let wf = WorkflowSpec::new(COLONY)
        .with_function(node("a").with_dependency("b"))
        .with_function(node("b").with_dependency("a"));
    let err = orch.submit_workflow(wf, "tester").await.unwrap_err();
    assert!(matches!(err, ColonyError::Validation(_)));
    assert!(orch
        .find_process_graphs(COLONY, None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_add_child_hangs_off_parent() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;

    let extra = orch
        .add_child(graph.id, add_child(task1.id, "extra"))
        .await
        .unwrap();
    assert!(extra.wait_for_parents);
    assert_eq!(extra.parents, vec![task1.id]);

    let task1_now = member(&orch, graph.id, "task1").await;
    assert_eq!(task1_now.children.len(), 2);
    assert!(task1_now.children.contains(&extra.id));

    orch.close(task1.id, "execA", vec![json!("x")]).await.unwrap();
    let mut names = vec![
        assign(&orch, "execA").await.node_name().to_string(),
        assign(&orch, "execA").await.node_name().to_string(),
    ];
    names.sort();
    assert_eq!(names, vec!["extra", "task2"]);

    let graph = orch.get_process_graph(graph.id).await.unwrap();
    assert_eq!(graph.process_ids.len(), 3);
    assert!(graph.nodes.contains_key("extra"));
}

#[tokio::test]
async fn test_add_child_insert_splices_between_parent_and_children() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;

    let mut request = add_child(task1.id, "middle");
    request.insert = true;
    let middle = orch.add_child(graph.id, request).await.unwrap();

    let task2 = member(&orch, graph.id, "task2").await;
    assert_eq!(task2.parents, vec![middle.id]);
    assert_eq!(member(&orch, graph.id, "task1").await.children, vec![middle.id]);

    orch.close(task1.id, "execA", vec![]).await.unwrap();
    let next = assign(&orch, "execA").await;
    assert_eq!(next.node_name(), "middle");
    assert!(try_assign(&orch, "execA").await.unwrap_err().is_no_work());

    orch.close(next.id, "execA", vec![json!("spliced")]).await.unwrap();
    let last = assign(&orch, "execA").await;
    assert_eq!(last.node_name(), "task2");
    assert_eq!(last.input, vec![json!("spliced")]);
}

#[tokio::test]
async fn test_add_child_feeding_existing_child() {
    let orch = test_orchestrator();
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = member(&orch, graph.id, "task1").await;
    let task2 = member(&orch, graph.id, "task2").await;

    let mut request = add_child(task1.id, "side");
    request.child_id = Some(task2.id);
    let side = orch.add_child(graph.id, request).await.unwrap();

    let task2 = member(&orch, graph.id, "task2").await;
    assert_eq!(task2.parents, vec![task1.id, side.id]);
    assert_eq!(side.children, vec![task2.id]);
}

#[tokio::test]
async fn test_add_child_rejects_cycle() {
    let orch = test_orchestrator();
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = member(&orch, graph.id, "task1").await;
    let task2 = member(&orch, graph.id, "task2").await;

    let mut request = add_child(task2.id, "loop");
    request.child_id = Some(task1.id);
    let err = orch.add_child(graph.id, request).await.unwrap_err();
    assert!(matches!(err, ColonyError::Validation(_)));

    // Nothing was written
    let graph = orch.get_process_graph(graph.id).await.unwrap();
    assert_eq!(graph.process_ids.len(), 2);
    assert!(member(&orch, graph.id, "task1").await.parents.is_empty());
}

#[tokio::test]
async fn test_add_child_rejects_invalid_requests() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let wf = WorkflowSpec::new(COLONY)
        .with_function(node("a"))
        .with_function(node("b"))
        .with_function(node("c").with_dependency("b"));
    let graph = orch.submit_workflow(wf, "tester").await.unwrap();
    let a = member(&orch, graph.id, "a").await;

    // Duplicate node name
    let err = orch
        .add_child(graph.id, add_child(a.id, "b"))
        .await
        .unwrap_err();
    assert!(matches!(err, ColonyError::Validation(_)));

    // Parent from another graph
    let other = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let foreign = member(&orch, other.id, "task1").await;
    assert!(orch
        .add_child(graph.id, add_child(foreign.id, "x"))
        .await
        .is_err());

    // Parent that can never succeed
    orch.cancel(a.id).await.unwrap();
    let err = orch
        .add_child(graph.id, add_child(a.id, "after-cancel"))
        .await
        .unwrap_err();
    assert!(matches!(err, ColonyError::Validation(_)));

    // Terminal graph
    orch.cancel_workflow(graph.id).await.unwrap();
    let b = member(&orch, graph.id, "b").await;
    let err = orch
        .add_child(graph.id, add_child(b.id, "too-late"))
        .await
        .unwrap_err();
    assert!(matches!(err, ColonyError::Validation(_)));
}

#[tokio::test]
async fn test_add_child_under_succeeded_parent_is_ready() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;
    orch.close(task1.id, "execA", vec![json!(7)]).await.unwrap();

    let late = orch
        .add_child(graph.id, add_child(task1.id, "late"))
        .await
        .unwrap();
    assert!(!late.wait_for_parents);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let p = assign(&orch, "execA").await;
        assert_eq!(p.input, vec![json!(7)]);
        seen.push(p.node_name().to_string());
    }
    seen.sort();
    assert_eq!(seen, vec!["late", "task2"]);
}

/// Two edits planned from the same snapshot: the second one must not
/// overwrite the links written by the first.
#[tokio::test]
async fn test_stale_graph_edit_is_rejected() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;

    let snapshot = orch.get_process_graph(graph.id).await.unwrap();
    let members = orch.store().get_graph_members(graph.id).await.unwrap();
    let x1 = plan_child_insertion(&snapshot, &members, add_child(task1.id, "x1")).unwrap();
    let x2 = plan_child_insertion(&snapshot, &members, add_child(task1.id, "x2")).unwrap();

    orch.store().insert_graph_member(graph.id, &x1).await.unwrap();
    let err = orch
        .store()
        .insert_graph_member(graph.id, &x2)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let parent = member(&orch, graph.id, "task1").await;
    assert_eq!(parent.children.len(), 2);
    assert!(parent.children.contains(&x1.process.id));
    assert!(orch.get_process(x2.process.id).await.is_err());

    // Re-planned through the orchestrator, x2 lands alongside x1
    let x2 = orch
        .add_child(graph.id, add_child(task1.id, "x2"))
        .await
        .unwrap();
    orch.close(task1.id, "execA", vec![]).await.unwrap();
    for name in ["task2", "x1", "x2"] {
        assert!(
            !member(&orch, graph.id, name).await.wait_for_parents,
            "{} should be released",
            name
        );
    }
    assert_eq!(
        member(&orch, graph.id, "task1").await.children.len(),
        3,
        "x2 {} must stay linked",
        x2.id
    );
}

/// A parent that succeeds between planning and inserting invalidates the
/// plan; the retried edit sees the success and leaves the child ungated.
#[tokio::test]
async fn test_graph_edit_planned_before_parent_finished() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;

    let snapshot = orch.get_process_graph(graph.id).await.unwrap();
    let members = orch.store().get_graph_members(graph.id).await.unwrap();
    let planned = plan_child_insertion(&snapshot, &members, add_child(task1.id, "late")).unwrap();
    assert!(planned.process.wait_for_parents);

    orch.close(task1.id, "execA", vec![]).await.unwrap();
    let err = orch
        .store()
        .insert_graph_member(graph.id, &planned)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let late = orch
        .add_child(graph.id, add_child(task1.id, "late"))
        .await
        .unwrap();
    assert!(!late.wait_for_parents);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_child_keeps_every_link() {
    let orch = test_orchestrator();
    register(&orch, "execA").await;
    let graph = orch
        .submit_workflow(two_step_workflow(), "tester")
        .await
        .unwrap();
    let task1 = assign(&orch, "execA").await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let orch = orch.clone();
            let (graph_id, parent_id) = (graph.id, task1.id);
            tokio::spawn(async move {
                orch.add_child(graph_id, add_child(parent_id, &format!("x{}", i)))
                    .await
            })
        })
        .collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(member(&orch, graph.id, "task1").await.children.len(), 9);
    orch.close(task1.id, "execA", vec![]).await.unwrap();
    for i in 0..8 {
        let child = member(&orch, graph.id, &format!("x{}", i)).await;
        assert!(!child.wait_for_parents, "x{} never released", i);
    }
}

/// Members requeued by a concurrent failure are still cancelled.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_workflow_racing_requeue() {
    for _ in 0..20 {
        let orch = test_orchestrator();
        register(&orch, "execA").await;
        let wf = WorkflowSpec::new(COLONY)
            .with_function(node("a").with_max_retries(-1))
            .with_function(node("b").with_max_retries(-1));
        let graph = orch.submit_workflow(wf, "tester").await.unwrap();
        let leased = vec![assign(&orch, "execA").await, assign(&orch, "execA").await];

        let failures: Vec<_> = leased
            .iter()
            .map(|p| {
                let orch = orch.clone();
                let id = p.id;
                tokio::spawn(async move { orch.fail(id, "execA", vec!["retry".to_string()]).await })
            })
            .collect();
        let cancelled = orch.cancel_workflow(graph.id).await.unwrap();
        // A failure that lost the race may report a conflict; that is fine
        let _ = join_all(failures).await;

        let graph = orch.get_process_graph(cancelled.id).await.unwrap();
        assert_eq!(graph.state, GraphState::Cancelled);
        for p in orch.store().get_graph_members(graph.id).await.unwrap() {
            assert_eq!(p.state, ProcessState::Cancelled, "{} escaped", p.node_name());
        }
        assert!(try_assign(&orch, "execA").await.unwrap_err().is_no_work());
    }
}
