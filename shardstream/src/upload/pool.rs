//! Bounded, fail-fast pool of upload tasks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::limiter::ConcurrencyLimiter;
use super::UploadError;
use crate::storage::{ObjectStore, StorageError};

/// Base delay between upload attempts; attempt `n` waits `n` times this.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// One local file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub local: PathBuf,
    pub key: String,
    /// Delete the local file once it is uploaded
    pub delete_after: bool,
}

/// How a single upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { key: String, attempts: u32 },
    Failed { key: String },
    Cancelled { key: String },
}

/// Totals over every job submitted to a pool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl UploadSummary {
    fn record(&mut self, outcome: &UploadOutcome) {
        match outcome {
            UploadOutcome::Uploaded { .. } => self.uploaded += 1,
            UploadOutcome::Failed { .. } => self.failed += 1,
            UploadOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }
}

/// State shared by the pool and its tasks.
struct Shared {
    store: Arc<dyn ObjectStore>,
    limiter: ConcurrencyLimiter,
    cancel: CancellationToken,
    first_error: Mutex<Option<UploadError>>,
    attempts: u32,
    backoff: Duration,
    started: AtomicUsize,
}

impl Shared {
    /// Keep the first failure and stop everything not yet started.
    fn fail(&self, err: UploadError) {
        error!(error = %err, "Upload failed, cancelling pending uploads");
        let mut first = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some(err);
        }
        drop(first);
        self.cancel.cancel();
        self.limiter.close();
    }
}

/// Runs uploads on the current Tokio runtime with at most `max_workers` in
/// flight.
///
/// Each job is tried `1 + retry` times. The first job to fail for good cancels
/// the pool: jobs that have not started yet end as
/// [`UploadOutcome::Cancelled`], later submissions are refused, and
/// [`join`](Self::join) reports that first failure. Uploads already in flight
/// run to completion.
pub struct UploadPool {
    shared: Arc<Shared>,
    tasks: JoinSet<UploadOutcome>,
    refused: usize,
}

impl UploadPool {
    pub fn new(store: Arc<dyn ObjectStore>, max_workers: usize, retry: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                limiter: ConcurrencyLimiter::new(max_workers, "upload"),
                cancel: CancellationToken::new(),
                first_error: Mutex::new(None),
                attempts: retry.saturating_add(1),
                backoff: DEFAULT_RETRY_BACKOFF,
                started: AtomicUsize::new(0),
            }),
            tasks: JoinSet::new(),
            refused: 0,
        }
    }

    /// Set the base retry delay. Only valid before the first submission.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.backoff = backoff;
        }
        self
    }

    /// Whether a failure (or the caller) has cancelled the pool.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Cancel every upload that has not started yet.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.limiter.close();
    }

    /// Uploads that got past the limiter, whatever their result.
    pub fn started(&self) -> usize {
        self.shared.started.load(Ordering::Relaxed)
    }

    /// Queue a job. Returns `false`, without queueing, once cancelled.
    pub fn submit(&mut self, job: UploadJob) -> bool {
        if self.is_cancelled() {
            debug!(key = %job.key, "Pool cancelled, not submitting upload");
            self.refused += 1;
            return false;
        }
        trace!(key = %job.key, local = %job.local.display(), "Submitting upload");
        let shared = self.shared.clone();
        self.tasks.spawn(run_job(shared, job));
        true
    }

    /// Wait for every submitted job, then report the first failure if any.
    pub async fn join(mut self) -> Result<UploadSummary, UploadError> {
        let mut summary = UploadSummary {
            cancelled: self.refused,
            ..UploadSummary::default()
        };
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    summary.failed += 1;
                    self.shared.fail(UploadError::Task(e.to_string()));
                }
            }
        }

        let first = self
            .shared
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(
            limiter = self.shared.limiter.label(),
            max_workers = self.shared.limiter.max_concurrent(),
            started = self.started(),
            peak_in_flight = self.shared.limiter.peak_in_flight(),
            uploaded = summary.uploaded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Upload pool drained"
        );
        match first {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

async fn run_job(shared: Arc<Shared>, job: UploadJob) -> UploadOutcome {
    let permit = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => None,
        permit = shared.limiter.acquire() => permit,
    };
    let Some(_permit) = permit else {
        trace!(key = %job.key, "Upload cancelled before start");
        return UploadOutcome::Cancelled { key: job.key };
    };
    if shared.cancel.is_cancelled() {
        return UploadOutcome::Cancelled { key: job.key };
    }
    shared.started.fetch_add(1, Ordering::Relaxed);
    trace!(key = %job.key, in_flight = shared.limiter.in_flight(), "Upload started");

    let mut last_error = None;
    for attempt in 1..=shared.attempts {
        let store = shared.store.clone();
        let local = job.local.clone();
        let key = job.key.clone();
        let result = tokio::task::spawn_blocking(move || store.upload(&local, &key))
            .await
            .unwrap_or_else(|e| {
                Err(StorageError::Transfer {
                    key: job.key.clone(),
                    message: e.to_string(),
                })
            });

        match result {
            Ok(()) => {
                debug!(key = %job.key, attempt, "Uploaded");
                if job.delete_after {
                    if let Err(e) = std::fs::remove_file(&job.local) {
                        warn!(
                            path = %job.local.display(),
                            error = %e,
                            "Failed to remove uploaded file"
                        );
                    }
                }
                return UploadOutcome::Uploaded {
                    key: job.key,
                    attempts: attempt,
                };
            }
            Err(e) => {
                warn!(
                    key = %job.key,
                    attempt,
                    max = shared.attempts,
                    error = %e,
                    "Upload attempt failed"
                );
                last_error = Some(e);
            }
        }
        if attempt < shared.attempts {
            tokio::time::sleep(shared.backoff * attempt).await;
        }
    }

    if let Some(source) = last_error {
        shared.fail(UploadError::Failed {
            local: job.local,
            key: job.key.clone(),
            attempts: shared.attempts,
            source,
        });
    }
    UploadOutcome::Failed { key: job.key }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Fails the first `failures[key]` attempts on each key and records
    /// every attempt.
    #[derive(Default)]
    struct ScriptedStore {
        failures: StdMutex<HashMap<String, u32>>,
        attempts: StdMutex<Vec<String>>,
    }

    impl ScriptedStore {
        fn failing(key: &str, times: u32) -> Self {
            let store = Self::default();
            store.failures.lock().unwrap().insert(key.to_string(), times);
            store
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl ObjectStore for ScriptedStore {
        fn name(&self) -> &str {
            "scripted"
        }

        fn exists(&self, _key: &str) -> Result<bool, StorageError> {
            Ok(false)
        }

        fn download(&self, key: &str, _local: &Path) -> Result<u64, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }

        fn upload(&self, _local: &Path, key: &str) -> Result<(), StorageError> {
            self.attempts.lock().unwrap().push(key.to_string());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(key) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(StorageError::Transfer {
                        key: key.to_string(),
                        message: "injected".to_string(),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    fn job(dir: &TempDir, key: &str) -> UploadJob {
        let local = dir.path().join(key);
        std::fs::write(&local, key).unwrap();
        UploadJob {
            local,
            key: key.to_string(),
            delete_after: false,
        }
    }

    #[tokio::test]
    async fn test_uploads_all_jobs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScriptedStore::default());
        let mut pool = UploadPool::new(store.clone(), 2, 0);
        for key in ["a", "b", "c"] {
            assert!(pool.submit(job(&dir, key)));
        }
        let summary = pool.join().await.unwrap();
        assert_eq!(summary.uploaded, 3);
        assert_eq!(store.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_started_counts_only_jobs_past_the_limiter() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScriptedStore::default());
        let mut pool = UploadPool::new(store, 2, 0);
        for key in ["a", "b", "c"] {
            pool.submit(job(&dir, key));
        }
        while pool.started() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(pool.shared.limiter.peak_in_flight() <= 2);
        pool.join().await.unwrap();

        let mut cancelled = UploadPool::new(Arc::new(ScriptedStore::default()), 1, 0);
        cancelled.cancel();
        cancelled.submit(job(&dir, "d"));
        assert_eq!(cancelled.started(), 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScriptedStore::failing("a", 2));
        let mut pool =
            UploadPool::new(store.clone(), 1, 2).with_backoff(Duration::from_millis(1));
        pool.submit(job(&dir, "a"));

        let summary = pool.join().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(store.attempts(), vec!["a", "a", "a"]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_cancel() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScriptedStore::failing("a", 5));
        let mut pool =
            UploadPool::new(store.clone(), 1, 1).with_backoff(Duration::from_millis(1));
        pool.submit(job(&dir, "a"));

        while !pool.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!pool.submit(job(&dir, "b")));

        let err = pool.join().await.unwrap_err();
        match err {
            UploadError::Failed { key, attempts, .. } => {
                assert_eq!(key, "a");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.attempts(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_delete_after_upload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScriptedStore::default());
        let mut pool = UploadPool::new(store, 1, 0);
        let mut j = job(&dir, "a");
        j.delete_after = true;
        let local = j.local.clone();
        pool.submit(j);
        pool.join().await.unwrap();
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_pending_jobs_are_cancelled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScriptedStore::default());
        let mut pool = UploadPool::new(store.clone(), 1, 0);
        pool.cancel();
        assert!(!pool.submit(job(&dir, "a")));
        let summary = pool.join().await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert!(store.attempts().is_empty());
    }
}
