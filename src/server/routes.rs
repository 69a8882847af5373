//! Route handlers for the compression API.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use sizeforge_av::ToolInfo;
use sizeforge_core::{Error, JobId};
use tokio_util::io::ReaderStream;

use super::error::AppError;
use super::AppContext;
use crate::orchestrator::{CleanupReceipt, CompressReceipt, JobStatusView, UploadReceipt};

/// Multipart field carrying the uploaded video.
const UPLOAD_FIELD: &str = "file";

fn parse_job_id(raw: &str) -> Result<JobId, Error> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("invalid job id: {raw}")))
}

/// Health check response.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Jobs currently known to the service.
    pub jobs: usize,
    pub tools: Vec<ToolInfo>,
}

/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        jobs: ctx.orchestrator.registry().len(),
        tools: ctx.tools.as_ref().clone(),
    })
}

/// Multipart form accepted by the upload route.
#[derive(utoipa::ToSchema)]
pub struct UploadForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

/// POST /upload
#[utoipa::path(
    post,
    path = "/upload",
    tag = "jobs",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Upload stored, job created", body = UploadReceipt),
        (status = 400, description = "Missing, empty, oversized or unreadable file")
    )
)]
pub async fn upload(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let receipt = ctx.orchestrator.upload(&filename, field).await?;
        return Ok(Json(receipt));
    }

    Err(Error::Validation(format!("no `{UPLOAD_FIELD}` field in the upload")).into())
}

/// Request body for starting a compression.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CompressRequest {
    pub job_id: String,
    /// Desired output size in bytes.
    pub target_size: u64,
}

/// POST /compress
#[utoipa::path(
    post,
    path = "/compress",
    tag = "jobs",
    request_body = CompressRequest,
    responses(
        (status = 200, description = "Compression started, on a fresh job when retrying a finished one", body = CompressReceipt),
        (status = 400, description = "Malformed request body or invalid target size"),
        (status = 404, description = "Unknown job"),
        (status = 409, description = "Job is compressing or was already retried"),
        (status = 422, description = "Target too small or duration unknown")
    )
)]
pub async fn compress(
    State(ctx): State<AppContext>,
    payload: Result<Json<CompressRequest>, JsonRejection>,
) -> Result<Json<CompressReceipt>, AppError> {
    let Json(payload) = payload.map_err(|rejection| {
        Error::Validation(format!("invalid compress request: {}", rejection.body_text()))
    })?;
    let id = parse_job_id(&payload.job_id)?;
    let receipt = ctx.orchestrator.compress(id, payload.target_size)?;
    Ok(Json(receipt))
}

/// Query parameters for status polling.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatusParams {
    /// Return log lines from this index onwards.
    #[serde(default)]
    pub since: usize,
}

/// GET /status/{job_id}
#[utoipa::path(
    get,
    path = "/status/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id"), StatusParams),
    responses(
        (status = 200, description = "Current job state", body = JobStatusView),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn status(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
    Query(params): Query<StatusParams>,
) -> Result<Json<JobStatusView>, AppError> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(ctx.orchestrator.status(id, params.since)?))
}

/// GET /download/{job_id}
#[utoipa::path(
    get,
    path = "/download/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "The compressed video as an MP4 attachment"),
        (status = 404, description = "Unknown job"),
        (status = 409, description = "Job is not completed")
    )
)]
pub async fn download(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_job_id(&job_id)?;
    let target = ctx.orchestrator.download(id).await?;

    let file = tokio::fs::File::open(&target.path).await.map_err(Error::from)?;
    let body = Body::from_stream(ReaderStream::new(file));

    let headers = [
        (header::CONTENT_TYPE, "video/mp4".to_string()),
        (header::CONTENT_LENGTH, target.size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", target.filename),
        ),
    ];

    Ok((headers, body))
}

/// POST /cleanup/{job_id} and DELETE /jobs/{job_id}
#[utoipa::path(
    post,
    path = "/cleanup/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses((status = 200, description = "Job and files removed (or never existed)", body = CleanupReceipt))
)]
pub async fn cleanup(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<Json<CleanupReceipt>, AppError> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(ctx.orchestrator.cleanup(id).await))
}
