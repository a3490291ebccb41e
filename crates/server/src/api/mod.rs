use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stepflow_core::{AppContext, EngineError, ErrorKind};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;
    AppContext::install(state.context.clone())?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route("/api/workflows/{workflow_id}", get(handlers::get_workflow))
        .route("/api/workflows/{workflow_id}/plan", get(handlers::get_plan))
        .route(
            "/api/workflows/{workflow_id}/runs",
            get(handlers::list_workflow_runs).post(handlers::run_workflow),
        )
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route("/api/runs/{run_id}/events", get(handlers::get_run_events))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "stepflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Malformed request parameters
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BadRequest(pub String);

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequest>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        match self.0.downcast_ref::<EngineError>().map(EngineError::kind) {
            Some(kind) => status_for(kind),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DuplicateWorkflow | ErrorKind::DuplicateHandler | ErrorKind::InvalidRunState => {
            StatusCode::CONFLICT
        }
        kind if kind.is_definition_error() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.0);
        }

        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");
        let response = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.downcast_ref::<EngineError>().map(EngineError::kind),
            details: (!details.is_empty()).then_some(details),
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageBackend, StorageConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let config = ServerConfig {
            data_dir: std::env::temp_dir(),
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..Default::default()
            },
        };
        create_router(AppState::new(&config).unwrap())
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn greeting_workflow() -> Value {
        json!({
            "id": "greeting",
            "name": "Greeting",
            "entry": "greet",
            "steps": [
                {
                    "id": "greet",
                    "name": "Greet",
                    "step_type": "template",
                    "inputs": {
                        "template": { "type": "literal", "value": "Hello, {{name}}" },
                        "name": { "type": "run_input", "key": "name" }
                    }
                },
                {
                    "id": "wrap",
                    "name": "Wrap",
                    "step_type": "merge",
                    "depends_on": ["greet"],
                    "inputs": {
                        "done": { "type": "literal", "value": true }
                    }
                }
            ]
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::DuplicateWorkflow), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::CyclicDependency), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Storage), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health() {
        let app = router();
        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "stepflow");
    }

    #[tokio::test]
    async fn test_create_and_run_workflow() {
        let app = router();

        let (status, body) =
            call(&app, Method::POST, "/api/workflows", Some(greeting_workflow())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["order"], json!(["greet", "wrap"]));

        let (status, body) =
            call(&app, Method::POST, "/api/workflows", Some(greeting_workflow())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "duplicate_workflow");

        let (status, run) = call(
            &app,
            Method::POST,
            "/api/workflows/greeting/runs",
            Some(json!({ "inputs": { "name": "Ada" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "succeeded");
        assert_eq!(run["step_results"]["wrap"]["outputs"]["text"], "Hello, Ada");
        assert_eq!(run["step_results"]["wrap"]["outputs"]["done"], true);

        let run_id = run["id"].as_str().unwrap();
        let (status, fetched) = call(&app, Method::GET, &format!("/api/runs/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, run);

        let (status, events) =
            call(&app, Method::GET, &format!("/api/runs/{}/events", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events["events"][0]["event_type"]["type"], "run_created");

        let (_, runs) = call(&app, Method::GET, "/api/workflows/greeting/runs", None).await;
        assert_eq!(runs["runs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let app = router();
        let mut workflow = greeting_workflow();
        workflow["steps"][0]["depends_on"] = json!(["wrap"]);

        let (status, body) = call(&app, Method::POST, "/api/workflows", Some(workflow)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "cyclic_dependency");

        let (status, _) = call(&app, Method::GET, "/api/workflows/greeting", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_run_id() {
        let app = router();
        let (status, _) = call(&app, Method::GET, "/api/runs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/api/runs/{}", stepflow_core::RunId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }
}
