//! Annotated frame endpoints (/results/*)

use axum::{
    Router,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use std::sync::Arc;

use crate::AppState;
use crate::services::error::{ApiError, LogErr};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/results/{run_id}/{filename}", get(run_result))
        .route("/results/{filename}", get(latest_result))
}

fn content_type_for(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    }
}

async fn serve_result(
    state: &AppState,
    run_id: &str,
    filename: &str,
    cache_control: &'static str,
) -> Result<impl IntoResponse + use<>, ApiError> {
    let path = state
        .runs
        .result_path(run_id, filename)
        .ok_or(ApiError::NotFound)?;

    let bytes = tokio::fs::read(&path)
        .await
        .log_status("[results] Result file unavailable", ApiError::NotFound)?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(filename)),
            (header::CACHE_CONTROL, cache_control),
        ],
        bytes,
    ))
}

/// GET /results/:run_id/:filename - Annotated frame of a retained run
async fn run_result(
    State(state): State<Arc<AppState>>,
    Path((run_id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    // Run ids are never reused, so a retained file never changes
    serve_result(&state, &run_id, &filename, "private, max-age=3600").await
}

/// GET /results/:filename - Annotated frame of the most recent run
async fn latest_result(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state.runs.latest().ok_or(ApiError::NotFound)?;
    serve_result(&state, &run_id, &filename, "no-cache").await
}
