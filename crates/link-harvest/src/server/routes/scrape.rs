//! Inline processing: upload a spreadsheet, get the augmented one back

use axum::{
    extract::{Multipart, State},
    http::HeaderValue,
    response::Response,
};

use super::jobs::csv_attachment;
use super::{batch_request, read_upload};
use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::JobState;

const OUTPUT_FILENAME: &str = "social_media_links_output.csv";

/// Response header naming the job that produced the attachment
pub const JOB_ID_HEADER: &str = "x-job-id";

/// POST /api/scrape - Run a batch and wait for the CSV
///
/// A `job_id` in the options lets the caller follow progress on
/// `/api/jobs/:id/events` while this request is pending.
pub async fn scrape(State(state): State<AppState>, multipart: Multipart) -> Result<Response> {
    let upload = read_upload(multipart).await?;
    let request = batch_request(&state, upload)?;

    let manager = state.manager();
    let job = manager.run_inline(request).await?;

    match job.state {
        JobState::Success => {
            let (_, bytes) = manager.read_artifact(job.id)?;
            let mut response = csv_attachment(OUTPUT_FILENAME, bytes);
            if let Ok(value) = HeaderValue::from_str(&job.id.to_string()) {
                response.headers_mut().insert(JOB_ID_HEADER, value);
            }
            Ok(response)
        }
        _ => Err(Error::processing(format!(
            "job {} failed: {}",
            job.id,
            job.error.as_deref().unwrap_or("unknown error")
        ))),
    }
}
