//! Push progress: per-job broadcast channels

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{JobSnapshot, JobState};

/// Progress notification pushed to subscribers of a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub state: JobState,
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobSnapshot> for ProgressEvent {
    fn from(job: &JobSnapshot) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            completed: job.completed,
            total: job.total,
            percent: job.percent_complete(),
            attempt: job.attempt,
            artifact: job.artifact.clone(),
            error: job.error.clone(),
        }
    }
}

/// Job-keyed broadcast hub
///
/// Channels are created lazily on first subscribe and dropped when the job
/// reaches a terminal state, which ends every subscriber's stream.
pub struct ProgressHub {
    channels: DashMap<Uuid, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event. No-op if nobody subscribed.
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(tx) = self.channels.get(&event.job_id) {
            // No receivers left is fine
            let _ = tx.send(event);
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop a job's channel; receivers see the stream end after draining
    pub fn close(&self, job_id: Uuid) {
        self.channels.remove(&job_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}
