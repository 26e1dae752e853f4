//! Job submission, status, progress and result endpoints

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use uuid::Uuid;

use super::{batch_request, read_upload};
use crate::error::Result;
use crate::processing::{ProgressEvent, QueueStats};
use crate::server::state::AppState;
use crate::types::{JobSnapshot, JobState, JobStatus};

/// Response from async submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub total_records: usize,
    pub message: String,
}

/// Job status as returned by the API
///
/// The state-tagged [`JobStatus`] is flattened in, so `state` decides which of
/// `completed`/`total`, `artifact` or `cause` are present.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub status: JobStatus,
    pub percent_complete: u8,
    pub attempt: u32,
    pub total_records: usize,
    pub failed_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobSnapshot> for JobResponse {
    fn from(job: &JobSnapshot) -> Self {
        let result_url = (job.state == JobState::Success)
            .then(|| format!("/api/jobs/{}/result", job.id));

        Self {
            job_id: job.id,
            status: job.status(),
            percent_complete: job.percent_complete(),
            attempt: job.attempt,
            total_records: job.total,
            failed_records: job.failed_records,
            result_url,
            created_at: job.created_at,
            started_at: job.started_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

/// Response for listing jobs
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub stats: QueueStats,
}

/// POST /api/jobs - Upload a spreadsheet for async processing
pub async fn submit_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    let upload = read_upload(multipart).await?;
    let request = batch_request(&state, upload)?;
    let total_records = request.batch.len();

    let job_id = state.manager().submit(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            total_records,
            message: format!("Job queued successfully. Use /api/jobs/{} to check progress.", job_id),
        }),
    ))
}

/// GET /api/jobs - List all jobs with queue stats
pub async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    let manager = state.manager();
    let jobs = manager
        .list()
        .iter()
        .map(|job| JobResponse::from(job.as_ref()))
        .collect();

    Json(JobListResponse {
        jobs,
        stats: manager.stats(),
    })
}

/// GET /api/jobs/:id - Get job status
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let job = state.manager().status(job_id)?;
    Ok(Json(JobResponse::from(job.as_ref())))
}

/// DELETE /api/jobs/:id - Cancel a pending or running job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobResponse>)> {
    let job = state.manager().cancel(job_id)?;
    Ok((StatusCode::ACCEPTED, Json(JobResponse::from(job.as_ref()))))
}

/// GET /api/jobs/:id/result - Download the result spreadsheet
pub async fn job_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response> {
    let (job, bytes) = state.manager().read_artifact(job_id)?;
    let filename = job.artifact.clone().unwrap_or_else(|| format!("{}.csv", job_id));
    Ok(csv_attachment(&filename, bytes))
}

/// GET /api/jobs/:id/events - Stream progress until the job is terminal
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<BoxStream<'static, std::result::Result<Event, Infallible>>>> {
    let subscription = state.manager().subscribe(job_id)?;

    let events = subscription
        .into_stream()
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)))
        .boxed();

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &ProgressEvent) -> Event {
    let name = if event.state.is_terminal() { "complete" } else { "progress" };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

pub(crate) fn csv_attachment(filename: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}
