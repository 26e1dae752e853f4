//! Background processing with job queue and progress tracking

mod chunk_runner;
mod events;
mod job_manager;
mod progress;
mod worker;

pub use chunk_runner::{ChunkProgress, ChunkRunner, RunOutput};
pub use events::{ProgressEvent, ProgressHub};
pub use job_manager::{
    BatchRequest, JobManager, ProgressSubscription, QueueStats, QueuedJob,
};
pub use progress::{ProgressPolicy, ProgressSnapshot, ProgressTracker};
pub use worker::{spawn_workers, ProcessingWorker};
