//! Storage module for persistent data storage
//!
//! SQLite-backed job status and file-based result artifacts.

mod artifacts;
mod database;

pub use artifacts::{render_csv, CsvResultSink, ResultSink};
pub use database::{JobStatusStore, StoreStats, INTERRUPTED_CAUSE};
