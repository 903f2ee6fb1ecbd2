//! Download routes: queueing, queue control, progress, and range-capable
//! streaming of finished files.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeFile;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::retention::RetentionMeta;
use crate::session::{DownloadSession, DownloadStatus};
use crate::upstream::TranscodePreset;

/// Create the downloads router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_download))
        .route("/list", get(list_downloads))
        .route("/progress/{id}", get(get_progress))
        .route("/stream/{id}", get(stream_download))
        .route("/queue/info", get(queue_info))
        .route("/{id}", delete(cancel_download))
        .route("/{id}/remove", delete(remove_download))
        .route("/{id}/resume", post(resume_download))
        .route("/{id}/pause", post(pause_download))
        .route("/{id}/unpause", post(unpause_download))
        .route("/{id}/move-to-front", post(move_to_front))
        .route("/{id}/position", put(set_position))
        .route("/{id}/retention", put(set_retention))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadRequest {
    #[serde(default)]
    pub item_id: String,
    pub media_source_id: Option<String>,
    pub preset: String,
    pub audio_stream_index: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadResponse {
    pub session_id: String,
    pub filename: String,
    pub estimated_size: u64,
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<StartDownloadRequest>,
) -> ApiResult<Json<StartDownloadResponse>> {
    if request.item_id.is_empty() {
        return Err(ApiError::bad_request("itemId is required"));
    }
    let preset = TranscodePreset::parse(&request.preset)
        .ok_or_else(|| ApiError::bad_request(format!("unknown preset `{}`", request.preset)))?;

    let session = state
        .manager
        .start_download(
            &request.item_id,
            request.media_source_id.as_deref(),
            preset,
            request.audio_stream_index,
        )
        .await?;

    Ok(Json(StartDownloadResponse {
        estimated_size: preset.estimated_size_bytes(session.duration_seconds),
        session_id: session.id,
        filename: session.filename,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadListResponse {
    pub downloads: Vec<DownloadSession>,
}

async fn list_downloads(State(state): State<AppState>) -> Json<DownloadListResponse> {
    Json(DownloadListResponse {
        downloads: state.manager.get_all_downloads().await,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub status: DownloadStatus,
    pub completed_segments: u32,
    pub total_segments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let session = state.manager.get_progress(&id).await?;
    Ok(Json(ProgressResponse {
        status: session.status,
        completed_segments: session.completed_segments,
        total_segments: session.total_segments,
        error: session.error,
    }))
}

/// Serve the finished file with HTTP Range support, so players can seek and
/// clients can resume interrupted transfers.
async fn stream_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let session = state.manager.get_progress(&id).await?;
    if session.status != DownloadStatus::Completed {
        return Err(ApiError::bad_request(format!(
            "download is {}, not Completed",
            session.status
        )));
    }

    let path = state.manager.store().session_dir(&id).join(&session.filename);
    if !path.exists() {
        return Err(ApiError::not_found(format!("file for download {id} not found")));
    }

    state.leases.touch(&id);
    match ServeFile::new(path).try_call(req).await {
        Ok(response) => Ok(response.into_response()),
        Err(e) => Err(ApiError::internal(format!("Failed to serve file: {e}"))),
    }
}

async fn queue_info(State(state): State<AppState>) -> Json<crate::manager::QueueInfo> {
    Json(state.manager.queue_info().await)
}

async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadSession>> {
    state.manager.cancel_download(&id).await?;
    Ok(Json(state.manager.get_progress(&id).await?))
}

async fn remove_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.remove_download(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadSession>> {
    state.manager.resume_download(&id).await?;
    Ok(Json(state.manager.get_progress(&id).await?))
}

async fn pause_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadSession>> {
    state.manager.pause_download(&id).await?;
    Ok(Json(state.manager.get_progress(&id).await?))
}

async fn unpause_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadSession>> {
    state.manager.resume_paused_download(&id).await?;
    Ok(Json(state.manager.get_progress(&id).await?))
}

async fn move_to_front(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadSession>> {
    state.manager.move_to_front(&id).await?;
    Ok(Json(state.manager.get_progress(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRequest {
    pub position: u32,
}

async fn set_position(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PositionRequest>,
) -> ApiResult<Json<DownloadSession>> {
    state.manager.reorder_queue(&id, request.position).await?;
    Ok(Json(state.manager.get_progress(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRequest {
    /// Days to keep the file; `null` clears the override and inherits the
    /// global default.
    pub retention_days: Option<u32>,
}

async fn set_retention(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RetentionRequest>,
) -> ApiResult<Json<RetentionMeta>> {
    let meta = state
        .manager
        .set_retention(&id, request.retention_days)
        .await?;
    Ok(Json(meta))
}
