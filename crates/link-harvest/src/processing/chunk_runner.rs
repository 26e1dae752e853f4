//! Chunked execution of a per-record processor over an ordered batch

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::extraction::{ItemProcessor, ProcessError};
use crate::types::{InputRecord, ResultRecord};

/// Progress reported after each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// 1-based index of the chunk that just finished
    pub chunk: usize,
    /// Number of chunks in the run
    pub chunks: usize,
    /// Records completed so far
    pub completed: usize,
    /// Records in the batch
    pub total: usize,
    /// Records so far that produced an empty result
    pub failed_records: usize,
}

/// Output of a full run
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// One result per input record, in input order
    pub results: Vec<ResultRecord>,
    /// Records that yielded an empty result
    pub failed_records: usize,
}

/// Per-record outcome, tagged with the record's ordinal
enum RecordOutcome {
    Done(ResultRecord),
    Absorbed(ResultRecord),
    Fatal(String),
}

/// Splits a batch into fixed-size chunks and runs the processor over them
///
/// Chunks run one after another; records inside a chunk run concurrently on a
/// bounded number of slots. Results are reassembled by ordinal, so output order
/// always matches input order.
#[derive(Debug, Clone)]
pub struct ChunkRunner {
    parallel_records: usize,
    record_timeout: Duration,
}

impl ChunkRunner {
    pub fn new(parallel_records: usize, record_timeout: Duration) -> Self {
        Self {
            parallel_records: parallel_records.max(1),
            record_timeout,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.parallel_records(), config.record_timeout())
    }

    /// `ceil(total / chunk_size)`
    pub fn chunk_count(total: usize, chunk_size: usize) -> usize {
        if chunk_size == 0 {
            return 0;
        }
        total.div_ceil(chunk_size)
    }

    /// Run `processor` over `records` in chunks of `chunk_size`.
    ///
    /// `on_chunk_done` is awaited exactly once per finished chunk, before the
    /// next chunk starts. Cancellation is checked before every chunk.
    pub async fn run<F, Fut>(
        &self,
        records: &[InputRecord],
        chunk_size: usize,
        processor: Arc<dyn ItemProcessor>,
        cancel: &CancellationToken,
        mut on_chunk_done: F,
    ) -> Result<RunOutput>
    where
        F: FnMut(ChunkProgress) -> Fut,
        Fut: Future<Output = ()>,
    {
        if chunk_size == 0 {
            return Err(Error::validation("chunk size must be positive"));
        }

        let total = records.len();
        let chunks = Self::chunk_count(total, chunk_size);
        let attributes: Arc<[String]> = processor.attributes().to_vec().into();
        let semaphore = Arc::new(Semaphore::new(self.parallel_records));

        let mut results = Vec::with_capacity(total);
        let mut failed_records = 0usize;

        for (chunk_index, chunk) in records.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(
                    "Run cancelled before chunk {}/{} ({} of {} records done)",
                    chunk_index + 1,
                    chunks,
                    results.len(),
                    total
                );
                return Err(Error::Cancelled);
            }

            let chunk_start = Instant::now();
            let offset = chunk_index * chunk_size;
            let mut slots: Vec<Option<ResultRecord>> = vec![None; chunk.len()];

            let mut in_flight: FuturesUnordered<_> = chunk
                .iter()
                .enumerate()
                .map(|(i, record)| {
                    let processor = Arc::clone(&processor);
                    let attributes = Arc::clone(&attributes);
                    let semaphore = Arc::clone(&semaphore);
                    let record_timeout = self.record_timeout;
                    async move {
                        let outcome = match semaphore.acquire().await {
                            Ok(_permit) => {
                                Self::process_record(
                                    processor.as_ref(),
                                    record,
                                    &attributes,
                                    record_timeout,
                                    offset + i,
                                )
                                .await
                            }
                            Err(_) => RecordOutcome::Fatal("worker slots closed".to_string()),
                        };
                        (i, outcome)
                    }
                })
                .collect();

            while let Some((i, outcome)) = in_flight.next().await {
                match outcome {
                    RecordOutcome::Done(result) => slots[i] = Some(result),
                    RecordOutcome::Absorbed(result) => {
                        failed_records += 1;
                        slots[i] = Some(result);
                    }
                    RecordOutcome::Fatal(message) => {
                        return Err(Error::processing(format!(
                            "chunk {}/{} aborted at record {}: {}",
                            chunk_index + 1,
                            chunks,
                            offset + i,
                            message
                        )));
                    }
                }
            }
            drop(in_flight);

            for (i, slot) in slots.into_iter().enumerate() {
                let result = slot.ok_or_else(|| {
                    Error::internal(format!("record {} produced no result", offset + i))
                })?;
                results.push(result);
            }

            let progress = ChunkProgress {
                chunk: chunk_index + 1,
                chunks,
                completed: results.len(),
                total,
                failed_records,
            };
            tracing::debug!(
                "Chunk {}/{} done in {:.2}s ({}/{} records)",
                progress.chunk,
                chunks,
                chunk_start.elapsed().as_secs_f64(),
                progress.completed,
                total
            );
            on_chunk_done(progress).await;
        }

        Ok(RunOutput {
            results,
            failed_records,
        })
    }

    async fn process_record(
        processor: &dyn ItemProcessor,
        record: &InputRecord,
        attributes: &[String],
        record_timeout: Duration,
        ordinal: usize,
    ) -> RecordOutcome {
        match timeout(record_timeout, processor.process(record)).await {
            Ok(Ok(result)) => RecordOutcome::Done(
                ResultRecord {
                    key: record.key.clone(),
                    ..result
                }
                .conform(attributes),
            ),
            Ok(Err(ProcessError::Recoverable(reason))) => {
                tracing::warn!("Record {} ({}) failed: {}", ordinal, record.key, reason);
                RecordOutcome::Absorbed(ResultRecord::empty(record.key.clone(), attributes))
            }
            Ok(Err(ProcessError::Permanent(reason))) => {
                tracing::warn!("Record {} ({}) is malformed: {}", ordinal, record.key, reason);
                RecordOutcome::Absorbed(ResultRecord::empty(record.key.clone(), attributes))
            }
            Ok(Err(ProcessError::Fatal(reason))) => {
                tracing::error!(
                    "Processor '{}' failed fatally on record {}: {}",
                    processor.name(),
                    ordinal,
                    reason
                );
                RecordOutcome::Fatal(reason)
            }
            Err(_) => {
                tracing::warn!(
                    "TIMEOUT on record {} ({}) after {}s",
                    ordinal,
                    record.key,
                    record_timeout.as_secs_f64()
                );
                RecordOutcome::Absorbed(ResultRecord::empty(record.key.clone(), attributes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the key in upper case; sleeps or fails for marked keys
    struct EchoProcessor {
        attributes: Vec<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl EchoProcessor {
        fn new() -> Self {
            Self {
                attributes: vec!["Upper".to_string(), "Length".to_string()],
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ItemProcessor for EchoProcessor {
        fn attributes(&self) -> &[String] {
            &self.attributes
        }

        async fn process(&self, record: &InputRecord) -> std::result::Result<ResultRecord, ProcessError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            // Later records finish first to shake up completion order
            let delay = 20u64.saturating_sub(record.key.len() as u64 * 2);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match record.key.as_str() {
                k if k.starts_with("slow") => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    unreachable!("should have timed out")
                }
                k if k.starts_with("down") => Err(ProcessError::Recoverable("unreachable".into())),
                k if k.starts_with("boom") => Err(ProcessError::Fatal("processor crashed".into())),
                k => Ok(ResultRecord::new(k)
                    .with_value("Upper", Some(k.to_uppercase()))
                    .with_value("Length", Some(k.len().to_string()))),
            }
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn records(n: usize) -> Vec<InputRecord> {
        (0..n).map(|i| InputRecord::new(format!("site{}.com", i))).collect()
    }

    fn runner() -> ChunkRunner {
        ChunkRunner::new(4, Duration::from_millis(200))
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(ChunkRunner::chunk_count(25, 10), 3);
        assert_eq!(ChunkRunner::chunk_count(20, 10), 2);
        assert_eq!(ChunkRunner::chunk_count(0, 10), 0);
        assert_eq!(ChunkRunner::chunk_count(5, 1), 5);
    }

    #[tokio::test]
    async fn test_progress_once_per_chunk() {
        let mut seen = Vec::new();
        let output = runner()
            .run(
                &records(25),
                10,
                Arc::new(EchoProcessor::new()),
                &CancellationToken::new(),
                |p| {
                    seen.push((p.completed, p.total));
                    async {}
                },
            )
            .await
            .unwrap();

        assert_eq!(seen, vec![(10, 25), (20, 25), (25, 25)]);
        assert_eq!(output.results.len(), 25);
        assert_eq!(output.failed_records, 0);
    }

    #[tokio::test]
    async fn test_chunk_size_does_not_change_results() {
        let input = records(7);
        let processor: Arc<dyn ItemProcessor> = Arc::new(EchoProcessor::new());
        let cancel = CancellationToken::new();

        let mut outputs = Vec::new();
        for chunk_size in [1, 7, 8] {
            let output = runner()
                .run(&input, chunk_size, Arc::clone(&processor), &cancel, |_| async {})
                .await
                .unwrap();
            outputs.push(output.results);
        }

        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[1], outputs[2]);
        let keys: Vec<&str> = outputs[0].iter().map(|r| r.key.as_str()).collect();
        let expected: Vec<String> = input.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, expected);
        assert_eq!(outputs[0][3].get("Upper"), Some("SITE3.COM"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let processor = Arc::new(EchoProcessor::new());
        ChunkRunner::new(2, Duration::from_secs(1))
            .run(&records(12), 12, processor.clone(), &CancellationToken::new(), |_| async {})
            .await
            .unwrap();
        assert!(processor.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_yield_empty_rows() {
        let input = vec![
            InputRecord::new("a.com"),
            InputRecord::new("slow.com"),
            InputRecord::new("down.com"),
            InputRecord::new("b.com"),
        ];
        let output = runner()
            .run(&input, 2, Arc::new(EchoProcessor::new()), &CancellationToken::new(), |_| async {})
            .await
            .unwrap();

        assert_eq!(output.results.len(), 4);
        assert_eq!(output.failed_records, 2);
        assert!(output.results[1].is_empty());
        assert_eq!(output.results[1].key, "slow.com");
        assert_eq!(output.results[1].values.len(), 2);
        assert!(output.results[2].is_empty());
        assert_eq!(output.results[3].get("Upper"), Some("B.COM"));
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_run() {
        let input = vec![InputRecord::new("a.com"), InputRecord::new("boom.com")];
        let mut calls = 0;
        let err = runner()
            .run(&input, 1, Arc::new(EchoProcessor::new()), &CancellationToken::new(), |_| {
                calls += 1;
                async {}
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Processing(_)));
        assert!(err.is_retryable());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_cancellation_between_chunks() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let err = runner()
            .run(&records(30), 10, Arc::new(EchoProcessor::new()), &cancel, |_| {
                calls += 1;
                cancel.cancel();
                async {}
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let mut calls = 0;
        let output = runner()
            .run(&[], 10, Arc::new(EchoProcessor::new()), &CancellationToken::new(), |_| {
                calls += 1;
                async {}
            })
            .await
            .unwrap();
        assert!(output.results.is_empty());
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let err = runner()
            .run(&records(3), 0, Arc::new(EchoProcessor::new()), &CancellationToken::new(), |_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
