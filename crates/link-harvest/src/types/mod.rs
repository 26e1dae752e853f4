//! Core types for the harvesting pipeline

pub mod job;
pub mod record;

pub use job::{JobSnapshot, JobState, JobStatus};
pub use record::{InputBatch, InputRecord, ResultHeader, ResultRecord};
