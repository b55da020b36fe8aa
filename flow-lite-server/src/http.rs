//! HTTP handlers. Thin delegations to the engine facade; every route maps
//! a typed engine error onto a status code.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flow_lite_core::{
    DoneItem, Flow, FlowEngine, FlowError, Form, HandleResult, HistoryEntry, NodeType,
    StartResult, TodoItem, VarBag, WorkFilter,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FlowEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/definitions", post(load_definition))
        .route("/flows/:code/start", post(start_flow))
        .route("/flows/:code/nodes/:node/form", get(node_form))
        .route("/work/:id/handle", post(handle_flow))
        .route("/instances/:id/stop", post(stop_flow))
        .route("/work/todo", get(query_todo))
        .route("/work/done", get(query_done))
        .route("/instances/:id/history", get(query_history))
        .with_state(state)
}

struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FlowError::FlowNotFound(_)
            | FlowError::NodeNotFound(_)
            | FlowError::NodeInstanceNotFound(_)
            | FlowError::FlowInstanceNotFound(_) => StatusCode::NOT_FOUND,
            FlowError::AlreadyDone(_) => StatusCode::CONFLICT,
            FlowError::NotCandidate { .. } => StatusCode::FORBIDDEN,
            FlowError::NoRoute(_) | FlowError::Definition(_) | FlowError::Eval(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Deserialize)]
struct StartRequest {
    start_node_code: String,
    launcher: String,
    #[serde(default)]
    input: VarBag,
}

#[derive(Deserialize)]
struct HandleRequest {
    user_id: String,
    #[serde(default)]
    vars: VarBag,
}

#[derive(Deserialize)]
struct WorkQuery {
    user_id: String,
    flow_code: Option<String>,
    type_code: Option<String>,
    since: Option<i64>,
    limit: Option<usize>,
}

impl WorkQuery {
    fn filter(&self) -> WorkFilter {
        WorkFilter {
            flow_code: self.flow_code.clone(),
            type_code: self.type_code.as_deref().and_then(NodeType::parse),
            limit: self.limit.unwrap_or(0),
        }
    }
}

async fn load_definition(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Flow>, ApiError> {
    Ok(Json(state.engine.load_definition(&body).await?))
}

async fn start_flow(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResult>, ApiError> {
    let result = state
        .engine
        .start_flow(&code, &req.start_node_code, &req.launcher, req.input)
        .await?;
    Ok(Json(result))
}

async fn handle_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<HandleRequest>,
) -> Result<Json<HandleResult>, ApiError> {
    let result = state.engine.handle_flow(id, &req.user_id, req.vars).await?;
    Ok(Json(result))
}

async fn stop_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.stop_flow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query_todo(
    State(state): State<AppState>,
    Query(query): Query<WorkQuery>,
) -> Result<Json<Vec<TodoItem>>, ApiError> {
    let items = state
        .engine
        .query_todo(&query.user_id, &query.filter())
        .await?;
    Ok(Json(items))
}

async fn query_done(
    State(state): State<AppState>,
    Query(query): Query<WorkQuery>,
) -> Result<Json<Vec<DoneItem>>, ApiError> {
    let items = state
        .engine
        .query_done(&query.user_id, &query.filter(), query.since.unwrap_or(0))
        .await?;
    Ok(Json(items))
}

async fn query_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    Ok(Json(state.engine.query_history(id).await?))
}

async fn node_form(
    State(state): State<AppState>,
    Path((code, node)): Path<(String, String)>,
) -> Result<Json<Option<Form>>, ApiError> {
    Ok(Json(state.engine.node_form(&code, &node).await?))
}
