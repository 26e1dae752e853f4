//! End-to-end job pipeline behaviour against a scripted processor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use link_harvest::config::HarvestConfig;
use link_harvest::ingestion::read_table;
use link_harvest::processing::{BatchRequest, JobManager, ProgressEvent};
use link_harvest::storage::{CsvResultSink, JobStatusStore, INTERRUPTED_CAUSE};
use link_harvest::{
    Error, InputBatch, InputRecord, ItemProcessor, JobSnapshot, JobState, ProcessError,
    ResultRecord,
};
use uuid::Uuid;

/// Keys drive behaviour: `slow*` outlives the record timeout, `flaky*` fails
/// fatally on its first call only, `boom*` always fails fatally, `nap*` sleeps
/// briefly. Everything else gets deterministic links.
struct Scripted {
    attributes: Vec<String>,
    flaked: AtomicBool,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attributes: vec!["Facebook".to_string(), "GitHub".to_string()],
            flaked: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ItemProcessor for Scripted {
    fn attributes(&self) -> &[String] {
        &self.attributes
    }

    async fn process(&self, record: &InputRecord) -> Result<ResultRecord, ProcessError> {
        let key = record.key.as_str();
        if key.starts_with("slow") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if key.starts_with("nap") {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        if key.starts_with("flaky") && !self.flaked.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::Fatal("browser session lost".to_string()));
        }
        if key.starts_with("boom") {
            return Err(ProcessError::Fatal("boom".to_string()));
        }

        Ok(ResultRecord::new(key)
            .with_value("Facebook", Some(format!("https://facebook.com/{}", key)))
            .with_value("GitHub", None))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct Harness {
    manager: Arc<JobManager>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let mut config = HarvestConfig::default();
    config.processing.record_timeout_secs = 1;
    config.retry.backoff_ms = 1;
    config.retry.max_backoff_ms = 5;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStatusStore::in_memory().unwrap());
    let sink = Arc::new(CsvResultSink::new(dir.path().join("artifacts")).unwrap());
    let (manager, _receiver) = JobManager::new(&config, store, sink);
    Harness {
        manager: Arc::new(manager),
        _dir: dir,
    }
}

fn batch(keys: &[String]) -> InputBatch {
    InputBatch::new(
        "domain",
        keys.iter().map(|k| InputRecord::new(k.clone())).collect(),
    )
}

fn keys(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}.com", prefix, i)).collect()
}

fn request(keys: &[String], processor: Arc<dyn ItemProcessor>) -> BatchRequest {
    BatchRequest::new(batch(keys), processor)
}

fn artifact_text(manager: &JobManager, job: &JobSnapshot) -> String {
    let (_, bytes) = manager.read_artifact(job.id).unwrap();
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn test_progress_events_per_chunk() {
    let h = harness();
    let job = h
        .manager
        .prepare(request(&keys("site", 25), Scripted::new()).with_chunk_size(10))
        .unwrap();
    let id = job.id();

    let events = h.manager.subscribe(id).unwrap().into_stream();
    let collector = tokio::spawn(events.collect::<Vec<ProgressEvent>>());

    h.manager.execute(job).await;
    let events = collector.await.unwrap();

    let running: Vec<usize> = events
        .iter()
        .filter(|e| e.state == JobState::Running && e.completed > 0)
        .map(|e| e.completed)
        .collect();
    assert_eq!(running, vec![10, 20, 25]);

    let last = events.last().unwrap();
    assert_eq!(last.state, JobState::Success);
    assert_eq!(last.percent, 100);

    let job = h.manager.status(id).unwrap();
    assert_eq!(job.state, JobState::Success);
    let text = artifact_text(&h.manager, &job);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 26);
    assert_eq!(lines[0], "domain,Facebook,GitHub");
    assert_eq!(lines[1], "site0.com,https://facebook.com/site0.com,");
    assert_eq!(lines[25], "site24.com,https://facebook.com/site24.com,");
}

#[tokio::test]
async fn test_chunk_size_does_not_change_results() {
    let h = harness();
    let input = keys("site", 7);

    let mut outputs = Vec::new();
    for chunk_size in [1, 7, 8] {
        let job = h
            .manager
            .run_inline(request(&input, Scripted::new()).with_chunk_size(chunk_size))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Success);
        outputs.push(artifact_text(&h.manager, &job));
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn test_empty_batch_succeeds_with_header_only() {
    let h = harness();
    let job = h.manager.run_inline(request(&[], Scripted::new())).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.total, 0);
    assert_eq!(artifact_text(&h.manager, &job), "domain,Facebook,GitHub\n");
}

#[tokio::test]
async fn test_retry_after_fatal_error_matches_clean_run() {
    let h = harness();
    let processor = Scripted::new();
    let mut input = keys("site", 4);
    input.insert(2, "flaky.com".to_string());

    let retried = h
        .manager
        .run_inline(request(&input, processor.clone()))
        .await
        .unwrap();
    assert_eq!(retried.state, JobState::Success);
    assert_eq!(retried.attempt, 2);

    // The processor no longer flakes, so this run succeeds first time
    let clean = h.manager.run_inline(request(&input, processor)).await.unwrap();
    assert_eq!(clean.attempt, 1);

    assert_eq!(artifact_text(&h.manager, &retried), artifact_text(&h.manager, &clean));
}

#[tokio::test]
async fn test_retries_exhausted() {
    let h = harness();
    let job = h
        .manager
        .run_inline(request(&["boom.com".to_string()], Scripted::new()))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Failure);
    assert_eq!(job.attempt, 4);
    assert!(job.error.as_deref().unwrap().contains("boom"));
    assert!(job.artifact.is_none());
}

#[tokio::test]
async fn test_timeout_fills_row_without_retry() {
    let h = harness();
    let input = vec!["a.com".to_string(), "slow.com".to_string(), "b.com".to_string()];
    let job = h.manager.run_inline(request(&input, Scripted::new())).await.unwrap();

    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.failed_records, 1);

    let text = artifact_text(&h.manager, &job);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[2], "slow.com,,");
    assert_eq!(lines[3], "b.com,https://facebook.com/b.com,");
}

#[tokio::test]
async fn test_cancel_running_job() {
    let h = harness();
    let job = h
        .manager
        .prepare(request(&keys("nap", 30), Scripted::new()).with_chunk_size(1))
        .unwrap();
    let id = job.id();

    let manager = &h.manager;
    let canceller = async {
        loop {
            let current = manager.status(id).unwrap();
            if current.state == JobState::Running && current.completed >= 2 {
                manager.cancel(id).unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::join!(manager.execute(job), canceller);

    let job = h.manager.status(id).unwrap();
    assert_eq!(job.state, JobState::Failure);
    assert_eq!(job.error.as_deref(), Some("cancelled"));
    assert_eq!(job.attempt, 1);
    assert!(job.completed < job.total);
}

#[tokio::test]
async fn test_abandoned_inline_run_still_finishes() {
    let h = harness();
    let waited = tokio::time::timeout(
        Duration::from_millis(120),
        h.manager
            .run_inline(request(&keys("nap", 20), Scripted::new()).with_chunk_size(1)),
    )
    .await;
    assert!(waited.is_err());

    let jobs = h.manager.list();
    assert_eq!(jobs.len(), 1);
    let id = jobs[0].id;

    let mut job = h.manager.status(id).unwrap();
    for _ in 0..500 {
        if job.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        job = h.manager.status(id).unwrap();
    }

    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.completed, 20);
    assert_eq!(artifact_text(&h.manager, &job).lines().count(), 21);
}

#[tokio::test]
async fn test_cancel_abandoned_inline_run() {
    let h = harness();
    let waited = tokio::time::timeout(
        Duration::from_millis(100),
        h.manager
            .run_inline(request(&keys("nap", 30), Scripted::new()).with_chunk_size(1)),
    )
    .await;
    assert!(waited.is_err());

    let id = h.manager.list()[0].id;
    h.manager.cancel(id).unwrap();

    let mut events = h.manager.subscribe(id).unwrap().into_stream();
    let mut last = None;
    while let Some(event) = events.next().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.state, JobState::Failure);
    assert_eq!(last.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_polled_progress_is_bounded_and_monotonic() {
    let h = harness();
    let job = h
        .manager
        .prepare(request(&keys("nap", 12), Scripted::new()).with_chunk_size(3))
        .unwrap();
    let id = job.id();

    let manager = &h.manager;
    let poller = async {
        let mut seen = Vec::new();
        loop {
            let current = manager.status(id).unwrap();
            assert!(current.completed <= current.total);
            seen.push(current.completed);
            if current.state.is_terminal() {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let (_, seen) = tokio::join!(manager.execute(job), poller);

    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&12));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let h = harness();
    let id = Uuid::new_v4();
    assert!(matches!(h.manager.status(id), Err(Error::JobNotFound(missing)) if missing == id));
    assert!(matches!(h.manager.read_artifact(id), Err(Error::JobNotFound(_))));
}

#[tokio::test]
async fn test_missing_key_column_creates_no_job() {
    let h = harness();
    let err = read_table("sites.csv", b"website\nacme.com\n", "domain").unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn test_restart_fails_interrupted_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");
    let config = HarvestConfig::default();

    let stale = {
        let store = JobStatusStore::new(&db).unwrap();
        let job = store.insert(JobSnapshot::new(Uuid::new_v4(), 5)).unwrap();
        store.replace(job.started(1).unwrap()).unwrap();
        job.id
    };

    let store = Arc::new(JobStatusStore::new(&db).unwrap());
    let sink = Arc::new(CsvResultSink::new(dir.path().join("artifacts")).unwrap());
    let (manager, _receiver) = JobManager::new(&config, store, sink);

    assert_eq!(manager.recover_interrupted().unwrap(), 1);
    let job = manager.status(stale).unwrap();
    assert_eq!(job.state, JobState::Failure);
    assert_eq!(job.error.as_deref(), Some(INTERRUPTED_CAUSE));
}
