//! Thin HTTP layer over the facade.
//!
//! The transport does no work of its own: every request becomes an
//! enqueued task and every response is the task's resolved output, with
//! error kinds mapped onto status codes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use kelp_retriever::merge::SearchResult;
use kelp_retriever::task_queue::TaskOutput;
use kelp_retriever::RetrieverError;
use serde::{Deserialize, Serialize};

use crate::service::{QueryFilters, SearchService};

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub limit_lines: Option<usize>,
    #[serde(default)]
    pub context_above: Option<u32>,
    #[serde(default)]
    pub context_below: Option<u32>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub chunks_analyzed: usize,
    pub total_files: usize,
    pub queue_depth: usize,
    pub last_analyzed_at_unix: Option<i64>,
    pub stale: bool,
}

pub fn router(service: Arc<SearchService>) -> Router {
    Router::new()
        .route("/api/query", post(query))
        .route("/api/status", get(status))
        .route("/api/reload", post(reload))
        .with_state(service)
}

async fn query(
    State(service): State<Arc<SearchService>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<SearchResult>, (StatusCode, String)> {
    let filters = QueryFilters {
        include_globs: request.include,
        exclude_globs: request.exclude,
        max_results: request.max_results,
        limit_lines: request.limit_lines,
        context_above: request.context_above,
        context_below: request.context_below,
        timeout: request.timeout_ms.map(Duration::from_millis),
    };
    let handle = service
        .submit_query(request.query, filters)
        .map_err(error_response)?;
    match handle.wait().await {
        Ok(TaskOutput::Query(result)) => Ok(Json(result)),
        Ok(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "unexpected task output".to_string(),
        )),
        Err(err) => Err(error_response(err)),
    }
}

async fn status(
    State(service): State<Arc<SearchService>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let handle = service.get_status().map_err(error_response)?;
    match handle.wait().await {
        Ok(TaskOutput::Stats(report)) => Ok(Json(StatusResponse {
            chunks_analyzed: report.chunks_analyzed,
            total_files: report.total_files,
            queue_depth: report.queue_depth,
            last_analyzed_at_unix: report.last_analyzed_at,
            stale: report.stale,
        })),
        Ok(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "unexpected task output".to_string(),
        )),
        Err(err) => Err(error_response(err)),
    }
}

async fn reload(
    State(service): State<Arc<SearchService>>,
) -> Result<StatusCode, (StatusCode, String)> {
    service.reload_config().await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

fn error_response(err: RetrieverError) -> (StatusCode, String) {
    let status = match err.code() {
        "EmptyQuery" | "InvalidRegex" => StatusCode::BAD_REQUEST,
        "Overloaded" => StatusCode::TOO_MANY_REQUESTS,
        "Cancelled" => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, format!("{}: {err}", err.code()))
}
