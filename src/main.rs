use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use colony_lite::config::{ColonyConfig, RetentionConfig, RetentionPolicy, ServerConfig};
use colony_lite::dashboard::{run_dashboard, DashboardState};
use colony_lite::scheduler::{Executor, ProcessGraph, WorkflowSpec};
use colony_lite::shutdown::install_shutdown_handler;
use colony_lite::store::MemoryStore;
use colony_lite::worker::{ExecutorLoop, ShellHandler};
use colony_lite::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "colony-lite")]
#[command(version)]
#[command(about = "A compute-job orchestrator with workflows, generators and crons")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start an orchestrator server
    Server(ServerArgs),

    /// Workflow file commands
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Maximum number of processes held in memory
    #[arg(long, default_value = "100000")]
    capacity: usize,

    /// Generator checker period in milliseconds
    #[arg(long, default_value = "1000")]
    generator_period_ms: u64,

    /// Cron checker period in milliseconds
    #[arg(long, default_value = "1000")]
    cron_period_ms: u64,

    /// Deadline sweep period in milliseconds
    #[arg(long, default_value = "1000")]
    sweep_period_ms: u64,

    /// Colonies that serialise assignment (comma-separated)
    #[arg(long, default_value = "")]
    exclusive_colonies: String,

    /// Remove terminal processes and graphs older than this many days
    #[arg(long)]
    retention_days: Option<u64>,

    // === Local executors ===
    /// Number of local shell executors to run in-process
    #[arg(long, default_value = "0")]
    shell_executors: usize,

    /// Colony the local executors join
    #[arg(long, default_value = "dev")]
    colony: String,

    /// Executor type of the local executors
    #[arg(long, default_value = "cli")]
    executor_type: String,

    /// Workflow files to submit once the server is up
    #[arg(long)]
    submit: Vec<PathBuf>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Workflow Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WorkflowCommands {
    /// Check a workflow file and print its execution order
    Validate {
        /// Path to the workflow JSON file
        file: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// Run a workflow to completion with local shell executors
    Run {
        /// Path to the workflow JSON file
        file: PathBuf,

        /// Number of local shell executors
        #[arg(long, default_value = "2")]
        executors: usize,

        /// Executor type of the local executors
        #[arg(long, default_value = "cli")]
        executor_type: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ValidateOutput {
    colony_name: String,
    order: Vec<String>,
    roots: Vec<String>,
}

#[derive(Serialize)]
struct RunProcessOutput {
    node_name: String,
    state: String,
    output: Vec<serde_json::Value>,
    errors: Vec<String>,
}

#[derive(Serialize)]
struct RunOutput {
    graph_id: String,
    state: String,
    processes: Vec<RunProcessOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_colonies(colonies: &str) -> Vec<String> {
    colonies
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn spawn_shell_executors(
    orchestrator: &Arc<Orchestrator>,
    colony: &str,
    executor_type: &str,
    count: usize,
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let handler = Arc::new(ShellHandler::new());
    (0..count)
        .map(|i| {
            let executor = Executor::new(format!("local-{}", i + 1), executor_type, colony);
            let worker = ExecutorLoop::new(orchestrator.clone(), executor, handler.clone())
                .with_heartbeat(Duration::from_secs(5));
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown).await {
                    tracing::error!(executor = %worker.executor().name, error = %e, "Executor stopped");
                }
            })
        })
        .collect()
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = ServerConfig::new(dashboard_addr);
    config.store_capacity = args.capacity;
    config.scheduler.generator_checker_period_ms = args.generator_period_ms;
    config.scheduler.cron_checker_period_ms = args.cron_period_ms;
    config.scheduler.deadline_sweep_period_ms = args.sweep_period_ms;
    for colony in parse_colonies(&args.exclusive_colonies) {
        config.scheduler = config.scheduler.with_colony(
            colony,
            ColonyConfig {
                exclusive_assign: true,
            },
        );
    }
    if let Some(days) = args.retention_days {
        config.scheduler = config.scheduler.with_retention(RetentionConfig {
            enabled: true,
            policy: RetentionPolicy {
                max_age_secs: days.saturating_mul(24 * 60 * 60),
            },
            ..RetentionConfig::default()
        });
    }

    tracing::info!(
        dashboard_addr = ?config.dashboard_addr,
        capacity = config.store_capacity,
        exclusive_colonies = ?config.scheduler.colonies.keys().collect::<Vec<_>>(),
        retention = config.scheduler.retention.enabled,
        shell_executors = args.shell_executors,
        "Starting colony-lite server"
    );

    let shutdown = install_shutdown_handler()?;
    let store = Arc::new(MemoryStore::with_capacity(config.store_capacity));
    let orchestrator = Arc::new(Orchestrator::new(store, config.scheduler.clone()));

    let mut handles = orchestrator.spawn_background(shutdown.clone());
    handles.extend(spawn_shell_executors(
        &orchestrator,
        &args.colony,
        &args.executor_type,
        args.shell_executors,
        &shutdown,
    ));

    if let Some(addr) = config.dashboard_addr {
        let state = DashboardState {
            orchestrator: orchestrator.clone(),
        };
        handles.push(tokio::spawn(run_dashboard(addr, state, shutdown.clone())));
    }

    for path in &args.submit {
        let workflow = WorkflowSpec::from_file(path).await?;
        let graph = orchestrator.submit_workflow(workflow, "cli").await?;
        tracing::info!(graph_id = %graph.id, file = %path.display(), "Workflow submitted");
    }

    shutdown.cancelled().await;
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Server stopped");
    Ok(())
}

// =============================================================================
// Workflow Command Handlers
// =============================================================================

async fn handle_workflow_validate(
    file: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = match WorkflowSpec::from_file(&file).await {
        Ok(wf) => wf,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let order = match workflow.validate() {
        Ok(order) => order,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let roots: Vec<String> = workflow.roots().into_iter().map(str::to_string).collect();

    match output_format {
        OutputFormat::Json => {
            let output = ValidateOutput {
                colony_name: workflow.colony_name.clone(),
                order,
                roots,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Colony:  {}", workflow.colony_name);
            println!("Roots:   {}", roots.join(", "));
            println!();
            println!("{:<4} {:<24} DEPENDS ON", "#", "NODE");
            let deps = workflow.dependency_map();
            for (i, name) in order.iter().enumerate() {
                let parents = deps.get(name).map(|d| d.join(", ")).unwrap_or_default();
                println!("{:<4} {:<24} {}", i + 1, name, parents);
            }
        }
    }
    Ok(())
}

async fn handle_workflow_run(
    file: PathBuf,
    executors: usize,
    executor_type: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = WorkflowSpec::from_file(&file).await?;
    let colony = workflow.colony_name.clone();

    let shutdown = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(store, Default::default()));
    let mut handles = orchestrator.spawn_background(shutdown.clone());
    handles.extend(spawn_shell_executors(
        &orchestrator,
        &colony,
        &executor_type,
        executors.max(1),
        &shutdown,
    ));

    let graph = orchestrator.submit_workflow(workflow, "cli").await?;
    let graph = wait_for_graph(&orchestrator, graph).await?;
    let members = orchestrator.store().get_graph_members(graph.id).await?;

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    match output_format {
        OutputFormat::Json => {
            let output = RunOutput {
                graph_id: graph.id.to_string(),
                state: graph.state.to_string(),
                processes: members
                    .iter()
                    .map(|p| RunProcessOutput {
                        node_name: p.node_name().to_string(),
                        state: p.state.to_string(),
                        output: p.output.clone(),
                        errors: p.errors.clone(),
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Graph ID: {}", graph.id);
            println!("State:    {}", graph.state);
            println!();
            println!("{:<24} {:<10} OUTPUT", "NODE", "STATE");
            for p in &members {
                let output = p
                    .output
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.trim().to_string(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let detail = if p.errors.is_empty() {
                    output
                } else {
                    p.errors.join("; ")
                };
                println!("{:<24} {:<10} {}", p.node_name(), p.state, detail);
            }
        }
    }
    Ok(())
}

async fn wait_for_graph(
    orchestrator: &Orchestrator,
    graph: ProcessGraph,
) -> Result<ProcessGraph, Box<dyn std::error::Error>> {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    loop {
        interval.tick().await;
        let current = orchestrator.get_process_graph(graph.id).await?;
        if current.state.is_terminal() {
            return Ok(current);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::Validate { file, output } => {
                handle_workflow_validate(file, &output).await?;
            }
            WorkflowCommands::Run {
                file,
                executors,
                executor_type,
                output,
            } => {
                init_logging();
                handle_workflow_run(file, executors, executor_type, &output).await?;
            }
        },
    }

    Ok(())
}
