//! Shared state behind every route

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::extraction::{ItemProcessor, SocialLinkExtractor};
use crate::processing::{spawn_workers, JobManager};
use crate::storage::{CsvResultSink, JobStatusStore, ResultSink};

/// Cheaply cloneable handle to the running pipeline
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: HarvestConfig,
    manager: Arc<JobManager>,
    store: Arc<JobStatusStore>,
    /// Processor applied to uploaded batches
    processor: Arc<dyn ItemProcessor>,
    workers: Vec<JoinHandle<()>>,
}

/// What `/ready` reports
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    /// Job store answered a query
    pub store: bool,
    pub workers: usize,
    pub workers_alive: usize,
}

impl AppState {
    /// Open storage and the extractor, then start the pipeline
    pub async fn new(config: HarvestConfig) -> Result<Self> {
        let store = Arc::new(JobStatusStore::new(&config.storage.database_path)?);
        tracing::info!("Job store opened at {}", config.storage.database_path.display());

        let sink = Arc::new(CsvResultSink::new(&config.storage.artifact_dir)?);
        tracing::info!("Artifacts stored in {}", config.storage.artifact_dir.display());

        let processor = Arc::new(SocialLinkExtractor::new(
            &config.extraction,
            config.processing.record_timeout(),
        )?);

        Self::from_parts(config, store, sink, processor)
    }

    /// Fail jobs a previous process left unfinished and start the worker pool.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_parts(
        config: HarvestConfig,
        store: Arc<JobStatusStore>,
        sink: Arc<dyn ResultSink>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Result<Self> {
        let (manager, receiver) = JobManager::new(&config, Arc::clone(&store), sink);
        let manager = Arc::new(manager);

        let interrupted = manager.recover_interrupted()?;
        if interrupted > 0 {
            tracing::warn!("Marked {} interrupted jobs as failed", interrupted);
        }

        let workers = spawn_workers(Arc::clone(&manager), receiver, config.processing.workers);
        tracing::info!(
            "Started {} workers for processor {}",
            workers.len(),
            processor.name()
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                manager,
                store,
                processor,
                workers,
            }),
        })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.inner.manager
    }

    pub fn processor(&self) -> Arc<dyn ItemProcessor> {
        Arc::clone(&self.inner.processor)
    }

    /// Ready while the job store answers and at least one worker is running
    pub fn readiness(&self) -> Readiness {
        let store = match self.inner.store.ping() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Job store is not answering: {}", e);
                false
            }
        };
        let workers_alive = self
            .inner
            .workers
            .iter()
            .filter(|handle| !handle.is_finished())
            .count();

        Readiness {
            ready: store && workers_alive > 0,
            store,
            workers: self.inner.workers.len(),
            workers_alive,
        }
    }
}
