//! API routes for the harvesting server

pub mod jobs;
pub mod scrape;

use axum::{
    extract::{DefaultBodyLimit, Multipart},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ingestion::read_table;
use crate::processing::BatchRequest;
use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Async submission with progress tracking
        .route(
            "/jobs",
            post(jobs::submit_job)
                .get(jobs::list_jobs)
                .layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/jobs/:id/events", get(jobs::job_events))
        .route("/jobs/:id/result", get(jobs::job_result))
        // Inline processing, responds with the spreadsheet
        .route(
            "/scrape",
            post(scrape::scrape).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        // Info
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "link-harvest",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Batch social media link extraction for spreadsheets of domains",
        "endpoints": {
            "POST /api/jobs": "Upload a CSV/XLSX for async processing",
            "POST /api/scrape": "Upload a CSV/XLSX and wait for the result spreadsheet",
            "GET /api/jobs": "List all jobs and queue stats",
            "GET /api/jobs/:id": "Get job status",
            "GET /api/jobs/:id/events": "Stream job progress (SSE)",
            "GET /api/jobs/:id/result": "Download the result spreadsheet",
            "DELETE /api/jobs/:id": "Cancel a job"
        }
    }))
}

/// Optional JSON carried in the `options` multipart field
#[derive(Debug, Default, Deserialize)]
pub struct UploadOptions {
    pub chunk_size: Option<usize>,
    pub key_column: Option<String>,
    /// Lets an inline caller follow `/api/jobs/:id/events` while it waits
    pub job_id: Option<Uuid>,
}

/// A spreadsheet upload
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
    pub options: UploadOptions,
}

/// Read the `file` and `options` fields of a multipart upload
pub async fn read_upload(mut multipart: Multipart) -> Result<Upload> {
    let mut file = None;
    let mut options = UploadOptions::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        Error::validation(format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "options" => {
                let data = field.bytes().await.map_err(|e| {
                    Error::validation(format!("Failed to read options: {}", e))
                })?;
                options = serde_json::from_slice(&data)
                    .map_err(|e| Error::validation(format!("Invalid options: {}", e)))?;
            }
            "file" => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "upload.csv".to_string());
                let data = field.bytes().await.map_err(|e| {
                    Error::validation(format!("Failed to read file {}: {}", filename, e))
                })?;
                tracing::info!("Received upload: {} ({} bytes)", filename, data.len());
                file = Some((filename, data.to_vec()));
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (filename, data) = file.ok_or_else(|| Error::validation("No file provided"))?;
    Ok(Upload {
        filename,
        data,
        options,
    })
}

/// Parse an upload into a batch request for the configured processor
pub fn batch_request(state: &AppState, upload: Upload) -> Result<BatchRequest> {
    let key_column = upload
        .options
        .key_column
        .as_deref()
        .unwrap_or(&state.config().extraction.key_column);

    let batch = read_table(&upload.filename, &upload.data, key_column)?;

    Ok(BatchRequest {
        batch,
        chunk_size: upload.options.chunk_size,
        processor: state.processor(),
        job_id: upload.options.job_id,
    })
}
