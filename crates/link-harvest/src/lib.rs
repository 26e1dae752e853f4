//! link-harvest: chunked batch jobs that harvest social media links from domain lists
//!
//! A spreadsheet of domains is split into fixed-size chunks, each record is run
//! through an [`extraction::ItemProcessor`] with bounded concurrency, and the
//! results are written as a CSV artifact. Jobs run either inline or on a worker
//! pool, retry processing-level failures, and report progress both through
//! polled status snapshots and pushed events.

pub mod config;
pub mod error;
pub mod extraction;
pub mod ingestion;
pub mod processing;
pub mod server;
pub mod storage;
pub mod types;

pub use config::HarvestConfig;
pub use error::{Error, Result};
pub use extraction::{ItemProcessor, ProcessError, SocialLinkExtractor};
pub use processing::{BatchRequest, JobManager};
pub use storage::{CsvResultSink, JobStatusStore, ResultSink};
pub use types::{InputBatch, InputRecord, JobSnapshot, JobState, JobStatus, ResultRecord};
