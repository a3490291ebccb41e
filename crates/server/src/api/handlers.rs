use super::{ApiResult, BadRequest};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stepflow_core::{
    events::Event,
    types::{Run, RunId, StepId, ValueMap, Workflow, WorkflowId},
    ExecutionPlan,
};

/// Compiled shape of a workflow
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub entry: StepId,
    pub order: Vec<StepId>,
    pub roots: Vec<StepId>,
}

impl From<&ExecutionPlan> for PlanResponse {
    fn from(plan: &ExecutionPlan) -> Self {
        Self {
            workflow_id: plan.workflow_id().clone(),
            version: plan.version(),
            entry: plan.entry().clone(),
            order: plan.order().to_vec(),
            roots: plan.root_steps(),
        }
    }
}

/// Register a new workflow definition
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(workflow): Json<Workflow>,
) -> ApiResult<(StatusCode, Json<PlanResponse>)> {
    let plan = state.context.create_workflow(&workflow)?;
    Ok((StatusCode::CREATED, Json(PlanResponse::from(plan.as_ref()))))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<Workflow>,
}

/// List all workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.context.list_workflows()?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

/// Get a specific workflow
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state.context.get_workflow(&WorkflowId::new(workflow_id))?;
    Ok(Json(workflow))
}

/// Get the execution plan of a workflow
pub async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<PlanResponse>> {
    let plan = state.context.plan(&WorkflowId::new(workflow_id))?;
    Ok(Json(PlanResponse::from(plan.as_ref())))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunWorkflowRequest {
    #[serde(default)]
    pub inputs: ValueMap,
}

/// Create a run and execute it to completion
pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<RunWorkflowRequest>,
) -> ApiResult<Json<Run>> {
    let run = state
        .context
        .run_workflow(&WorkflowId::new(workflow_id), req.inputs)
        .await?;
    Ok(Json(run))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// List runs of a workflow, most recent first
pub async fn list_workflow_runs(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<ListRunsResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);
    state.context.get_workflow(&workflow_id)?;
    let runs = state.context.list_runs(Some(&workflow_id))?;
    Ok(Json(ListRunsResponse { runs }))
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    let run = state.context.get_run(&parse_run_id(&run_id)?)?;
    Ok(Json(run))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

/// Get events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let events = state.context.run_events(parse_run_id(&run_id)?).await?;
    Ok(Json(GetRunEventsResponse { events }))
}

fn parse_run_id(raw: &str) -> Result<RunId, BadRequest> {
    raw.parse()
        .map_err(|_| BadRequest(format!("Invalid run ID: {}", raw)))
}
