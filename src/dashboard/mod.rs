use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::engine::Orchestrator;
use crate::error::ColonyError;
use crate::scheduler::{Process, ProcessGraph, ProcessState, WorkflowSpec};
use crate::store::ProcessFilter;

/// Maximum rows returned by the list endpoints.
const LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct DashboardState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Serialize)]
struct ProcessResponse {
    id: String,
    node_name: String,
    func_name: String,
    executor_type: String,
    state: String,
    assigned_executor_id: Option<String>,
    retries: u32,
    priority: i32,
    process_graph_id: Option<String>,
    wait_for_parents: bool,
    submission_time: String,
    start_time: Option<String>,
    end_time: Option<String>,
    output: Vec<Value>,
    errors: Vec<String>,
}

impl From<&Process> for ProcessResponse {
    fn from(process: &Process) -> Self {
        Self {
            id: process.id.to_string(),
            node_name: process.spec.node_name.clone(),
            func_name: process.spec.func_name.clone(),
            executor_type: process.executor_type().to_string(),
            state: process.state.to_string(),
            assigned_executor_id: process.assigned_executor_id.map(|id| id.to_string()),
            retries: process.retries,
            priority: process.spec.priority,
            process_graph_id: process.process_graph_id.map(|id| id.to_string()),
            wait_for_parents: process.wait_for_parents,
            submission_time: process.submission_time.to_rfc3339(),
            start_time: process.start_time.map(|t| t.to_rfc3339()),
            end_time: process.end_time.map(|t| t.to_rfc3339()),
            output: process.output.clone(),
            errors: process.errors.clone(),
        }
    }
}

#[derive(Serialize)]
struct GraphResponse {
    id: String,
    colony_name: String,
    state: String,
    initiator: String,
    submission_time: String,
    end_time: Option<String>,
    process_count: usize,
}

impl From<&ProcessGraph> for GraphResponse {
    fn from(graph: &ProcessGraph) -> Self {
        Self {
            id: graph.id.to_string(),
            colony_name: graph.colony_name.clone(),
            state: graph.state.to_string(),
            initiator: graph.initiator.clone(),
            submission_time: graph.submission_time.to_rfc3339(),
            end_time: graph.end_time.map(|t| t.to_rfc3339()),
            process_count: graph.process_ids.len(),
        }
    }
}

#[derive(Serialize)]
struct GraphDetailResponse {
    graph: GraphResponse,
    processes: Vec<ProcessResponse>,
}

#[derive(Deserialize)]
struct ProcessQuery {
    state: Option<String>,
}

#[derive(Deserialize)]
struct SubmitWorkflowRequest {
    workflow: WorkflowSpec,
    #[serde(default)]
    initiator: Option<String>,
}

#[derive(Serialize)]
struct SubmitWorkflowResponse {
    success: bool,
    graph_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(ColonyError);

impl From<ColonyError> for ApiError {
    fn from(e: ColonyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn status_for(e: &ColonyError) -> StatusCode {
    match e {
        ColonyError::Validation(_) | ColonyError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        ColonyError::ProcessNotFound(_)
        | ColonyError::ProcessGraphNotFound(_)
        | ColonyError::GeneratorNotFound(_)
        | ColonyError::CronNotFound(_)
        | ColonyError::ExecutorNotFound(_) => StatusCode::NOT_FOUND,
        ColonyError::Conflict(_) | ColonyError::NotLeaseOwner { .. } => StatusCode::CONFLICT,
        ColonyError::StoreFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/colonies/:colony/statistics", get(statistics_handler))
        .route("/api/colonies/:colony/processes", get(list_processes_handler))
        .route("/api/colonies/:colony/processgraphs", get(list_graphs_handler))
        .route("/api/processgraphs/:id", get(graph_handler))
        .route("/api/processgraphs/:id/cancel", post(cancel_graph_handler))
        .route("/api/workflows", post(submit_workflow_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn statistics_handler(
    State(state): State<DashboardState>,
    Path(colony): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.orchestrator.colony_statistics(&colony).await?;
    Ok(Json(stats))
}

async fn list_processes_handler(
    State(state): State<DashboardState>,
    Path(colony): Path<String>,
    Query(query): Query<ProcessQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match query.state.as_deref() {
        Some(s) => ProcessFilter::in_state(s.parse::<ProcessState>()?),
        None => ProcessFilter::default(),
    };
    let processes = state
        .orchestrator
        .find_processes(&colony, &filter, LIST_LIMIT)
        .await?;
    let body: Vec<ProcessResponse> = processes.iter().map(ProcessResponse::from).collect();
    Ok(Json(body))
}

async fn list_graphs_handler(
    State(state): State<DashboardState>,
    Path(colony): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let graphs = state
        .orchestrator
        .find_process_graphs(&colony, None, LIST_LIMIT)
        .await?;
    let body: Vec<GraphResponse> = graphs.iter().map(GraphResponse::from).collect();
    Ok(Json(body))
}

async fn graph_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let graph = state.orchestrator.get_process_graph(id).await?;
    let members = state.orchestrator.store().get_graph_members(id).await?;
    Ok(Json(GraphDetailResponse {
        graph: GraphResponse::from(&graph),
        processes: members.iter().map(ProcessResponse::from).collect(),
    }))
}

async fn cancel_graph_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let graph = state.orchestrator.cancel_workflow(id).await?;
    Ok(Json(GraphResponse::from(&graph)))
}

async fn submit_workflow_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitWorkflowRequest>,
) -> impl IntoResponse {
    let initiator = payload.initiator.unwrap_or_else(|| "dashboard".to_string());
    match state
        .orchestrator
        .submit_workflow(payload.workflow, &initiator)
        .await
    {
        Ok(graph) => (
            StatusCode::OK,
            Json(SubmitWorkflowResponse {
                success: true,
                graph_id: Some(graph.id.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(SubmitWorkflowResponse {
                success: false,
                graph_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}
