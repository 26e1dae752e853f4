//! Job lifecycle: submission, execution with retry, cancellation and status
//!
//! Every job runs under [`JobManager::supervise`], whether it was queued for a
//! worker or run inline for a waiting caller. Attempts execute on their own
//! task, so neither a caller that goes away nor a crashing processor can leave
//! a job without a terminal state. Status is written to the [`JobStatusStore`]
//! after every chunk; push subscribers are fed from the same snapshots through
//! the [`ProgressHub`].

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::chunk_runner::{ChunkProgress, ChunkRunner};
use super::events::{ProgressEvent, ProgressHub};
use super::progress::{ProgressPolicy, ProgressTracker};
use crate::config::{HarvestConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::extraction::ItemProcessor;
use crate::storage::{JobStatusStore, ResultSink, StoreStats};
use crate::types::{InputBatch, JobSnapshot, JobState, ResultHeader};

/// A batch to run through a processor
pub struct BatchRequest {
    pub batch: InputBatch,
    /// Records per chunk; the configured default when `None`
    pub chunk_size: Option<usize>,
    pub processor: Arc<dyn ItemProcessor>,
    /// Caller-chosen job id, so progress can be followed while an inline run is awaited
    pub job_id: Option<Uuid>,
}

impl BatchRequest {
    pub fn new(batch: InputBatch, processor: Arc<dyn ItemProcessor>) -> Self {
        Self {
            batch,
            chunk_size: None,
            processor,
            job_id: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// A registered job waiting to be executed
#[derive(Clone)]
pub struct QueuedJob {
    id: Uuid,
    batch: InputBatch,
    chunk_size: usize,
    processor: Arc<dyn ItemProcessor>,
    cancel: CancellationToken,
}

impl QueuedJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Queue and job counts
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub jobs: StoreStats,
    /// Jobs waiting in the channel for a worker
    pub queued: usize,
    pub workers: usize,
}

/// Current snapshot plus a live feed of later events
pub struct ProgressSubscription {
    pub current: Arc<JobSnapshot>,
    /// `None` when the job was already terminal
    pub receiver: Option<broadcast::Receiver<ProgressEvent>>,
}

impl ProgressSubscription {
    /// Stream starting with the current snapshot and ending after the terminal event.
    ///
    /// Events the current snapshot already covers are skipped; lagged events are
    /// dropped since every event carries absolute counts.
    pub fn into_stream(self) -> BoxStream<'static, ProgressEvent> {
        let initial = ProgressEvent::from(self.current.as_ref());
        let seen = (initial.attempt, initial.completed, initial.state);

        let Some(receiver) = self.receiver else {
            return stream::once(async move { initial }).boxed();
        };

        let live = BroadcastStream::new(receiver).filter_map(move |item| async move {
            let event = item.ok()?;
            let stale = event.state == seen.2
                && event.attempt == seen.0
                && event.completed <= seen.1;
            (!stale).then_some(event)
        });

        stream::once(async move { initial }).chain(live).boxed()
    }
}

/// Owns every job's lifecycle
pub struct JobManager {
    store: Arc<JobStatusStore>,
    sink: Arc<dyn ResultSink>,
    hub: ProgressHub,
    runner: ChunkRunner,
    retry: RetryConfig,
    policy: ProgressPolicy,
    default_chunk_size: usize,
    max_chunk_size: usize,
    workers: usize,
    sender: mpsc::Sender<QueuedJob>,
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl JobManager {
    /// Create a manager and the receiving end of its job queue
    pub fn new(
        config: &HarvestConfig,
        store: Arc<JobStatusStore>,
        sink: Arc<dyn ResultSink>,
    ) -> (Self, mpsc::Receiver<QueuedJob>) {
        let processing = &config.processing;
        let (sender, receiver) = mpsc::channel(processing.queue_capacity.max(1));

        let manager = Self {
            store,
            sink,
            hub: ProgressHub::new(),
            runner: ChunkRunner::from_config(processing),
            retry: config.retry.clone(),
            policy: processing.progress,
            default_chunk_size: processing.default_chunk_size,
            max_chunk_size: processing.max_chunk_size,
            workers: processing.workers,
            sender,
            cancellations: DashMap::new(),
        };

        (manager, receiver)
    }

    /// Resolve the requested chunk size against the configured default and bound
    pub fn validate_chunk_size(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            None => Ok(self.default_chunk_size),
            Some(0) => Err(Error::validation("chunk size must be positive")),
            Some(size) if size > self.max_chunk_size => Err(Error::validation(format!(
                "chunk size {} exceeds the maximum of {}",
                size, self.max_chunk_size
            ))),
            Some(size) => Ok(size),
        }
    }

    /// Validate a request and register it as a PENDING job
    pub fn prepare(&self, request: BatchRequest) -> Result<QueuedJob> {
        let chunk_size = self.validate_chunk_size(request.chunk_size)?;
        if request.processor.attributes().is_empty() {
            return Err(Error::validation(format!(
                "processor '{}' declares no attributes",
                request.processor.name()
            )));
        }

        let id = request.job_id.unwrap_or_else(Uuid::new_v4);
        self.store.insert(JobSnapshot::new(id, request.batch.len()))?;

        let cancel = CancellationToken::new();
        self.cancellations.insert(id, cancel.clone());

        tracing::info!(
            "Registered job {}: {} records, chunk size {}, processor {}",
            id,
            request.batch.len(),
            chunk_size,
            request.processor.name()
        );

        Ok(QueuedJob {
            id,
            batch: request.batch,
            chunk_size,
            processor: request.processor,
            cancel,
        })
    }

    /// Register a job and hand it to the worker pool. Returns as soon as it is queued.
    ///
    /// The queue slot is reserved before the job is registered, so a full or
    /// closed queue never leaves a PENDING job behind.
    pub async fn submit(&self, request: BatchRequest) -> Result<Uuid> {
        let permit = self
            .sender
            .reserve()
            .await
            .map_err(|_| Error::internal("job queue is closed"))?;

        let job = self.prepare(request)?;
        let job_id = job.id;
        permit.send(job);
        Ok(job_id)
    }

    /// Register a job and wait for it to finish.
    ///
    /// The job runs on its own task: if the caller stops waiting, it still
    /// runs to a terminal state and its artifact stays available.
    pub async fn run_inline(self: &Arc<Self>, request: BatchRequest) -> Result<Arc<JobSnapshot>> {
        let job = self.prepare(request)?;
        let job_id = job.id;

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise(job).await })
            .await
            .map_err(|e| Error::internal(format!("supervisor for job {} failed: {}", job_id, e)))?;

        self.store.get(job_id)
    }

    /// Run a job to a terminal state, retrying attempts whose task crashed.
    ///
    /// A panic while executing counts as a processing-level failure of the
    /// current attempt and is retried under the same policy and attempt
    /// budget as any other.
    pub async fn supervise(self: &Arc<Self>, job: QueuedJob) {
        let job_id = job.id;
        let max_attempts = self.retry.max_attempts();
        let mut first_attempt = 1;

        loop {
            let manager = Arc::clone(self);
            let run = job.clone();
            let task = tokio::spawn(async move { manager.execute_from(&run, first_attempt).await });

            let crash = match task.await {
                Ok(()) => return,
                Err(e) => e,
            };

            let current = match self.store.get(job_id) {
                Ok(current) if !current.state.is_terminal() => current,
                _ => {
                    self.hub.close(job_id);
                    self.cancellations.remove(&job_id);
                    return;
                }
            };
            let attempt = current.attempt.max(first_attempt);
            let cause = Error::processing(format!("execution crashed: {}", crash));

            if job.cancel.is_cancelled() {
                self.finish(job_id, Err(Error::Cancelled)).await;
                return;
            }
            if attempt >= max_attempts {
                self.finish(job_id, Err(cause)).await;
                return;
            }

            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                "Job {} attempt {}/{} failed: {}; retrying in {:?}",
                job_id,
                attempt,
                max_attempts,
                cause,
                delay
            );
            tokio::select! {
                _ = job.cancel.cancelled() => {
                    self.finish(job_id, Err(Error::Cancelled)).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            first_attempt = attempt + 1;
        }
    }

    /// Run a registered job on the current task, retrying processing-level
    /// failures, until it is terminal
    pub async fn execute(&self, job: QueuedJob) {
        self.execute_from(&job, 1).await;
    }

    async fn execute_from(&self, job: &QueuedJob, first_attempt: u32) {
        let job_id = job.id;
        let max_attempts = self.retry.max_attempts();
        let mut attempt = first_attempt - 1;
        let tracker = ProgressTracker::new(job.batch.len(), self.policy);

        let outcome = loop {
            attempt += 1;
            if job.cancel.is_cancelled() {
                break Err(Error::Cancelled);
            }

            match self.run_attempt(job, attempt, &tracker).await {
                Ok(artifact) => break Ok(artifact),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Job {} attempt {}/{} failed: {}; retrying in {:?}",
                        job_id,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = job.cancel.cancelled() => break Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.finish(job_id, outcome).await;
    }

    /// One attempt: RUNNING, chunked run, artifact write
    async fn run_attempt(
        &self,
        job: &QueuedJob,
        attempt: u32,
        tracker: &ProgressTracker,
    ) -> Result<String> {
        let current = self.store.get(job.id)?;
        let running = self.commit(current.started(attempt)?).await;
        self.hub.publish(ProgressEvent::from(running.as_ref()));

        tracing::info!(
            "Job {} attempt {}: processing {} records in chunks of {}",
            job.id,
            attempt,
            job.batch.len(),
            job.chunk_size
        );

        let job_id = job.id;
        tracker.reset();
        let output = self
            .runner
            .run(
                &job.batch.records,
                job.chunk_size,
                Arc::clone(&job.processor),
                &job.cancel,
                move |progress| self.record_progress(job_id, tracker, progress),
            )
            .await?;

        if output.failed_records > 0 {
            tracing::warn!(
                "Job {}: {} of {} records produced empty results",
                job.id,
                output.failed_records,
                job.batch.len()
            );
        }

        let header = ResultHeader::new(
            job.batch.key_column.clone(),
            job.processor.attributes().to_vec(),
        );
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.write(job_id, &header, &output.results))
            .await
            .map_err(|e| Error::internal(format!("artifact writer panicked: {}", e)))?
    }

    /// Chunk boundary: persist progress and push it when the policy says so
    async fn record_progress(&self, job_id: Uuid, tracker: &ProgressTracker, progress: ChunkProgress) {
        let emit = tracker.update(progress.completed, progress.total);
        let reading = tracker.snapshot();

        tracing::debug!(
            "Job {} chunk {}/{}: {}/{} records",
            job_id,
            progress.chunk,
            progress.chunks,
            progress.completed,
            progress.total
        );

        let next = self
            .store
            .get(job_id)
            .and_then(|current| current.with_progress(reading.completed, progress.failed_records));

        match next {
            Ok(next) => {
                let snapshot = self.commit(next).await;
                if emit {
                    self.hub.publish(ProgressEvent::from(snapshot.as_ref()));
                }
            }
            Err(e) => tracing::warn!("Job {}: failed to record progress: {}", job_id, e),
        }
    }

    /// Terminal transition, terminal event, and cleanup
    async fn finish(&self, job_id: Uuid, outcome: Result<String>) {
        let next = self.store.get(job_id).and_then(|current| match &outcome {
            Ok(artifact) => current.succeeded(artifact.clone()),
            Err(e) => current.failed(e.to_string()),
        });

        match next {
            Ok(next) => {
                let snapshot = self.commit(next).await;
                self.hub.publish(ProgressEvent::from(snapshot.as_ref()));
                match &outcome {
                    Ok(artifact) => tracing::info!("Job {} completed: {}", job_id, artifact),
                    Err(Error::Cancelled) => tracing::info!("Job {} cancelled", job_id),
                    Err(e) => tracing::error!("Job {} failed: {}", job_id, e),
                }
            }
            Err(e) => tracing::error!("Job {}: failed to record final state: {}", job_id, e),
        }

        self.hub.close(job_id);
        self.cancellations.remove(&job_id);
    }

    /// Replace the stored snapshot off the async threads. A persistence
    /// failure is logged and the in-memory snapshot stays authoritative.
    async fn commit(&self, next: JobSnapshot) -> Arc<JobSnapshot> {
        let store = Arc::clone(&self.store);
        let job_id = next.id;
        let fallback = next.clone();

        match tokio::task::spawn_blocking(move || store.replace(next)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                tracing::warn!("Job {}: status write failed: {}", job_id, e);
                Arc::new(fallback)
            }
            Err(e) => {
                tracing::warn!("Job {}: status writer panicked: {}", job_id, e);
                Arc::new(fallback)
            }
        }
    }

    /// Latest snapshot of a job
    pub fn status(&self, job_id: Uuid) -> Result<Arc<JobSnapshot>> {
        self.store.get(job_id)
    }

    pub fn list(&self) -> Vec<Arc<JobSnapshot>> {
        self.store.list()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            jobs: self.store.stats(),
            queued: self.sender.max_capacity() - self.sender.capacity(),
            workers: self.workers,
        }
    }

    /// Subscribe to a job's push progress
    pub fn subscribe(&self, job_id: Uuid) -> Result<ProgressSubscription> {
        self.store.get(job_id)?;

        // Subscribe before reading so no transition falls between the two
        let receiver = self.hub.subscribe(job_id);
        let current = self.store.get(job_id)?;

        if current.state.is_terminal() {
            self.hub.close(job_id);
            return Ok(ProgressSubscription {
                current,
                receiver: None,
            });
        }

        Ok(ProgressSubscription {
            current,
            receiver: Some(receiver),
        })
    }

    /// Request cancellation. Takes effect at the next chunk boundary, or when a
    /// worker picks up a job that is still pending.
    pub fn cancel(&self, job_id: Uuid) -> Result<Arc<JobSnapshot>> {
        let current = self.store.get(job_id)?;
        if current.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "job {} is already {}",
                job_id, current.state
            )));
        }

        let token = self
            .cancellations
            .get(&job_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::InvalidState(format!("job {} is not cancellable", job_id)))?;
        token.cancel();

        tracing::info!("Cancellation requested for job {}", job_id);
        Ok(current)
    }

    /// Artifact bytes of a successful job
    pub fn read_artifact(&self, job_id: Uuid) -> Result<(Arc<JobSnapshot>, Vec<u8>)> {
        let snapshot = self.store.get(job_id)?;
        let reference = match (&snapshot.artifact, snapshot.state) {
            (Some(reference), JobState::Success) => reference.clone(),
            _ => {
                return Err(Error::InvalidState(format!(
                    "job {} is {}, no result available",
                    job_id, snapshot.state
                )))
            }
        };
        let bytes = self.sink.read(&reference)?;
        Ok((snapshot, bytes))
    }

    /// Fail jobs a previous process left unfinished
    pub fn recover_interrupted(&self) -> Result<usize> {
        let failed = self.store.fail_interrupted()?;
        for job_id in &failed {
            tracing::warn!("Job {} was interrupted by a restart", job_id);
        }
        Ok(failed.len())
    }
}
