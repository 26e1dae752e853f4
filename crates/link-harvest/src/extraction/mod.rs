//! Per-record processors
//!
//! The pipeline treats the processor as a black box: one input record in, one
//! result record out. The social link extractor is the processor the server uses.

pub mod social;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{InputRecord, ResultRecord};

pub use social::{extract_links, normalize_url, SocialLinkExtractor};

/// Failure of a single record
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// Transient failure (unreachable host, timeout, bad status). The record
    /// yields an empty result and the batch continues.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// The record itself is malformed. Also absorbed into an empty result.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The processor can no longer run at all; aborts the attempt.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Trait for transforming one input record into one result record
///
/// Implementations:
/// - `SocialLinkExtractor`: fetches the domain's page and collects social links
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Attribute names produced for every record, in output column order
    fn attributes(&self) -> &[String];

    /// Process a single record
    async fn process(&self, record: &InputRecord) -> Result<ResultRecord, ProcessError>;

    /// Processor name for logging
    fn name(&self) -> &str;
}
