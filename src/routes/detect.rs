//! Detection endpoint (/detect)

use axum::{
    Json, Router,
    extract::{Multipart, State, multipart::Field, multipart::MultipartError},
    http::StatusCode,
    routing::post,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::AppState;
use crate::aggregate::RunSummary;
use crate::constants::{ALLOWED_VIDEO_EXTENSIONS, VIDEO_FIELD_NAME};
use crate::pipeline::PipelineError;
use crate::services::error::{ApiError, LogErr};
use crate::services::runs::RunWorkspace;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/detect", post(detect))
}

/// Lower-cased extension of `filename` if it is an accepted video type
pub fn allowed_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_VIDEO_EXTENSIONS
        .contains(&ext.as_str())
        .then_some(ext)
}

fn multipart_error(e: MultipartError) -> ApiError {
    log::warn!("[detect] Multipart error: {}", e);
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::MalformedUpload
    }
}

async fn save_field(field: &mut Field<'_>, path: &Path) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .log_500("[detect] Failed to create upload file")?;

    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        file.write_all(&chunk)
            .await
            .log_500("[detect] Failed to write upload")?;
        written += chunk.len() as u64;
    }
    file.flush().await.log_500("[detect] Failed to flush upload")?;
    Ok(written)
}

/// Run the pipeline for a saved upload and settle the workspace.
/// Spawned, so a disconnecting client cannot strand the run directory.
async fn process_run(
    state: Arc<AppState>,
    workspace: RunWorkspace,
    video_path: PathBuf,
) -> Result<RunSummary, ApiError> {
    let _slot = match state.run_slots.acquire().await {
        Ok(slot) => slot,
        Err(e) => {
            log::error!("[detect] Run slots closed: {}", e);
            state.runs.discard(workspace).await;
            return Err(ApiError::Internal);
        }
    };

    let pipeline = state.pipeline.clone();
    let run = workspace.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline.run(&run, &video_path))
        .await
        .map_err(PipelineError::from)
        .and_then(|result| result);

    match outcome {
        Ok(summary) => {
            state.runs.complete(&workspace).await;
            Ok(summary)
        }
        Err(e) => {
            log::warn!("[detect] Run {} failed: {}", workspace.id(), e);
            state.runs.discard(workspace).await;
            Err(e.into())
        }
    }
}

/// POST /detect - Upload a video (multipart field `video`), sample frames and run detection
async fn detect(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<RunSummary>, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        // Plain form values with the same name are not file uploads
        if field.name() != Some(VIDEO_FIELD_NAME) {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        let ext = allowed_extension(&filename).ok_or_else(|| {
            log::info!("[detect] Rejected upload {:?}", filename);
            ApiError::InvalidFileType
        })?;

        let pending = state
            .runs
            .begin()
            .await
            .log_500("[detect] Failed to allocate run workspace")?;
        let video_path = pending.workspace().upload_path(&ext);

        let bytes = match save_field(&mut field, &video_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                state.runs.discard(pending.into_workspace()).await;
                return Err(e);
            }
        };

        let workspace = pending.into_workspace();
        log::info!(
            "[detect] Run {} received {:?} ({} bytes)",
            workspace.id(),
            filename,
            bytes
        );

        let run_id = workspace.id().to_string();
        let task = tokio::spawn(process_run(state.clone(), workspace, video_path));
        return match task.await {
            Ok(result) => result.map(Json),
            Err(e) => {
                log::error!("[detect] Run {} task failed: {}", run_id, e);
                Err(ApiError::Internal)
            }
        };
    }

    Err(ApiError::MissingVideo)
}
