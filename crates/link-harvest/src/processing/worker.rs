//! Background workers draining the job queue

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::job_manager::{JobManager, QueuedJob};

/// Worker that runs queued jobs one at a time
pub struct ProcessingWorker {
    id: usize,
    manager: Arc<JobManager>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
}

impl ProcessingWorker {
    pub fn new(
        id: usize,
        manager: Arc<JobManager>,
        receiver: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    ) -> Self {
        Self {
            id,
            manager,
            receiver,
        }
    }

    /// Process jobs until the queue is closed
    pub async fn run(self) {
        tracing::info!("Processing worker {} started", self.id);

        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            let Some(job) = next else { break };

            let job_id = job.id();
            tracing::info!("Worker {} picked up job {}", self.id, job_id);

            self.manager.supervise(job).await;
            tracing::debug!("Worker {} finished job {}", self.id, job_id);
        }

        tracing::info!("Processing worker {} stopped", self.id);
    }
}

/// Spawn `count` workers sharing one queue receiver
pub fn spawn_workers(
    manager: Arc<JobManager>,
    receiver: mpsc::Receiver<QueuedJob>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..count.max(1))
        .map(|id| {
            let worker = ProcessingWorker::new(id, Arc::clone(&manager), Arc::clone(&receiver));
            tokio::spawn(worker.run())
        })
        .collect()
}
