use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use colony_lite::config::SchedulerConfig;
use colony_lite::scheduler::{Executor, FunctionSpec, WorkflowSpec};
use colony_lite::store::MemoryStore;
use colony_lite::worker::{ExecutorLoop, ShellHandler};
use colony_lite::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "local-workflow")]
#[command(about = "Run a diamond workflow against an in-process colony")]
struct Args {
    /// Number of shell executors
    #[arg(short, long, default_value = "2")]
    executors: usize,

    /// Colony name
    #[arg(long, default_value = "demo")]
    colony: String,
}

fn step(colony: &str, name: &str, command: &str) -> FunctionSpec {
    FunctionSpec::new(command, colony, "shell").with_node_name(name)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let colony = args.colony.as_str();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(MemoryStore::new()),
        SchedulerConfig::default(),
    ));
    let shutdown = CancellationToken::new();
    let background = orchestrator.spawn_background(shutdown.clone());

    let handler = Arc::new(ShellHandler::new());
    let mut workers = Vec::new();
    for i in 0..args.executors {
        let executor = Executor::new(format!("shell-{}", i + 1), "shell", colony);
        let worker = ExecutorLoop::new(orchestrator.clone(), executor, handler.clone());
        worker.register().await?;
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    // fetch -> {upper, count} -> report
    let workflow = WorkflowSpec::new(colony)
        .with_function(step(colony, "fetch", "echo").with_args(vec![json!("hello colony")]))
        .with_function(
            step(colony, "upper", "echo \"$COLONY_INPUT\" | tr 'a-z' 'A-Z'").with_dependency("fetch"),
        )
        .with_function(
            step(colony, "count", "echo \"$COLONY_INPUT\" | wc -c").with_dependency("fetch"),
        )
        .with_function(
            step(colony, "report", "echo \"$COLONY_INPUT\"")
                .with_dependency("upper")
                .with_dependency("count"),
        );

    let graph = orchestrator.submit_workflow(workflow, "demo").await?;
    println!("Submitted process graph {}", graph.id);

    let graph = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = orchestrator.get_process_graph(graph.id).await?;
        if current.state.is_terminal() {
            break current;
        }
    };

    println!("Process graph finished: {}", graph.state);
    println!("{:<10} {:<10} {}", "NODE", "STATE", "OUTPUT");
    println!("{}", "-".repeat(60));
    for process in orchestrator.store().get_graph_members(graph.id).await? {
        let output = process
            .output
            .iter()
            .map(|v| v.as_str().map(str::trim).unwrap_or_default().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<10} {:<10} {}",
            process.node_name(),
            process.state.to_string(),
            output
        );
    }

    shutdown.cancel();
    for worker in workers {
        worker.await??;
    }
    for handle in background {
        handle.await?;
    }
    Ok(())
}
