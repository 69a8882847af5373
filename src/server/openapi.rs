//! OpenAPI document for the compression API, served as JSON at
//! `/api/openapi.json`.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use super::AppContext;

/// OpenAPI documentation for sizeforge.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sizeforge API",
        description = "Compress uploaded videos to a requested file size with a two-pass encode",
    ),
    servers(
        (url = "/", description = "Default server")
    ),
    paths(
        super::routes::health,
        super::routes::upload,
        super::routes::compress,
        super::routes::status,
        super::routes::download,
        super::routes::cleanup,
    ),
    components(
        schemas(
            super::routes::HealthResponse,
            super::routes::UploadForm,
            super::routes::CompressRequest,
            crate::orchestrator::UploadReceipt,
            crate::orchestrator::CompressReceipt,
            crate::orchestrator::JobStatusView,
            crate::orchestrator::CleanupReceipt,
            crate::jobs::JobStatus,
            sizeforge_av::ToolInfo,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "jobs", description = "Upload, compress, poll, download and clean up jobs"),
    )
)]
pub struct ApiDoc;

/// Routes serving the OpenAPI document.
pub fn openapi_routes() -> Router<AppContext> {
    Router::new().route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
}
