//! Status tracking for long-running server jobs (imports, exports).
//!
//! Each tracked job is polled by its own cancellable task until it reaches a
//! terminal status. The latest status is mirrored into the cache under
//! `["jobs", id]` so cache subscribers observe progress.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::cache::{CacheStore, QueryKey};
use crate::query_key;

/// Consecutive failed polls after which tracking gives up.
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running {
        /// Percent complete, when the server reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Failed {
        error: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

pub type JobStatusFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<JobStatus, ApiError>> + Send + Sync>;

pub fn job_key(id: &str) -> QueryKey {
    query_key!["jobs", id]
}

struct TrackedJob {
    generation: u64,
    cancel: CancellationToken,
    status: Option<JobStatus>,
    poll_errors: u32,
    finished: bool,
}

struct TrackerInner {
    cache: CacheStore,
    status_fn: JobStatusFn,
    period: Duration,
    jobs: Mutex<HashMap<String, TrackedJob>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Polls job status on a fixed interval. Clone is cheap - clones share the
/// same set of jobs.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

impl JobTracker {
    pub fn new<F, Fut>(cache: CacheStore, period: Duration, status_fn: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobStatus, ApiError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(TrackerInner {
                cache,
                status_fn: Arc::new(move |id| status_fn(id).boxed()),
                period,
                jobs: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start polling `id`. Tracking the same id again replaces the earlier
    /// poll task. The handle resolves with the terminal status, or the error
    /// that ended tracking.
    pub fn track(&self, id: impl Into<String>) -> JoinHandle<Result<JobStatus, ApiError>> {
        let id = id.into();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.inner.shutdown.child_token();
        let previous = self.inner.jobs.lock().insert(
            id.clone(),
            TrackedJob {
                generation,
                cancel: cancel.clone(),
                status: None,
                poll_errors: 0,
                finished: false,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(job = %id, interval_ms = self.inner.period.as_millis() as u64, "Tracking job");
        let this = self.clone();
        tokio::spawn(async move { this.poll_loop(id, generation, cancel).await })
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.inner.jobs.lock().get(id).and_then(|job| job.status.clone())
    }

    /// Ids of jobs still being polled.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .jobs
            .lock()
            .iter()
            .filter(|(_, job)| !job.finished)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.jobs.lock().get(id) {
            Some(job) if !job.finished => {
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drop a finished job's record, returning its last status. Jobs still
    /// being polled are left alone.
    pub fn forget(&self, id: &str) -> Option<JobStatus> {
        let mut jobs = self.inner.jobs.lock();
        if jobs.get(id).map_or(true, |job| !job.finished) {
            return None;
        }
        jobs.remove(id).and_then(|job| job.status)
    }

    /// Stop every poll task.
    pub fn dispose(&self) {
        debug!("Disposing job tracker");
        self.inner.shutdown.cancel();
    }

    async fn poll_loop(
        self,
        id: String,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<JobStatus, ApiError> {
        let mut ticker = interval(self.inner.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = (self.inner.status_fn)(id.clone()) => polled,
            };

            match polled {
                Ok(status) => {
                    if let Ok(value) = serde_json::to_value(&status) {
                        self.inner.cache.set(job_key(&id), value);
                    }
                    let terminal = status.is_terminal();
                    self.update(&id, generation, |job| {
                        job.status = Some(status.clone());
                        job.poll_errors = 0;
                        job.finished = terminal;
                    });
                    if terminal {
                        info!(job = %id, status = ?status, "Job finished");
                        return Ok(status);
                    }
                }
                Err(error) => {
                    let mut errors = 0;
                    self.update(&id, generation, |job| {
                        job.poll_errors += 1;
                        errors = job.poll_errors;
                    });
                    warn!(
                        job = %id,
                        consecutive = errors,
                        error = %error,
                        "Job status poll failed"
                    );
                    if errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                        self.update(&id, generation, |job| job.finished = true);
                        return Err(error);
                    }
                }
            }
        }

        debug!(job = %id, "Job tracking cancelled");
        self.update(&id, generation, |job| job.finished = true);
        Err(ApiError::Cancelled)
    }

    fn update(&self, id: &str, generation: u64, f: impl FnOnce(&mut TrackedJob)) {
        if let Some(job) = self.inner.jobs.lock().get_mut(id) {
            if job.generation == generation {
                f(job);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    fn scripted(
        responses: Vec<Result<JobStatus, ApiError>>,
    ) -> (JobTracker, CacheStore, Arc<Mutex<u32>>) {
        let cache = CacheStore::new();
        let script = Arc::new(Mutex::new(VecDeque::from(responses)));
        let polls = Arc::new(Mutex::new(0));
        let counter = polls.clone();
        let tracker = JobTracker::new(cache.clone(), Duration::from_secs(1), move |_id| {
            *counter.lock() += 1;
            let next = script
                .lock()
                .pop_front()
                .unwrap_or(Ok(JobStatus::Running { progress: None }));
            async move { next }
        });
        (tracker, cache, polls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed() {
        let (tracker, cache, polls) = scripted(vec![
            Ok(JobStatus::Queued),
            Ok(JobStatus::Running { progress: Some(50.0) }),
            Ok(JobStatus::Completed { result: Some(json!({"rows": 120})) }),
        ]);

        let handle = tracker.track("import-1");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(tracker.status("import-1"), Some(JobStatus::Running { progress: Some(50.0) }));
        assert_eq!(tracker.active_jobs(), vec!["import-1".to_string()]);

        let status = handle.await.unwrap().unwrap();

        assert_eq!(status, JobStatus::Completed { result: Some(json!({"rows": 120})) });
        assert_eq!(*polls.lock(), 3);
        assert_eq!(
            cache.get(&job_key("import-1")),
            Some(json!({"status": "completed", "result": {"rows": 120}}))
        );
        assert!(tracker.active_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_errors() {
        let (tracker, _cache, polls) = scripted(vec![
            Err(ApiError::Timeout),
            Ok(JobStatus::Queued),
            Err(ApiError::Timeout),
            Err(ApiError::Timeout),
            Err(ApiError::Server { status: 502, message: "bad gateway".into() }),
        ]);

        let result = tracker.track("export-9").await.unwrap();

        assert_eq!(result, Err(ApiError::Server { status: 502, message: "bad gateway".into() }));
        assert_eq!(*polls.lock(), 5);
        assert_eq!(tracker.status("export-9"), Some(JobStatus::Queued));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_dispose_stop_polling() {
        let (tracker, _cache, polls) = scripted(vec![]);

        let first = tracker.track("a");
        let second = tracker.track("b");
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(tracker.cancel("a"));
        assert_eq!(first.await.unwrap(), Err(ApiError::Cancelled));
        assert!(!tracker.cancel("a"));

        tracker.dispose();
        assert_eq!(second.await.unwrap(), Err(ApiError::Cancelled));
        let after = *polls.lock();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*polls.lock(), after);
        assert!(tracker.active_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_finished_job() {
        let (tracker, cache, _polls) = scripted(vec![Ok(JobStatus::Completed { result: None })]);

        let running = tracker.track("sync-2");
        assert_eq!(tracker.forget("sync-2"), None);

        running.await.unwrap().unwrap();
        assert_eq!(tracker.forget("sync-2"), Some(JobStatus::Completed { result: None }));
        assert_eq!(tracker.status("sync-2"), None);
        assert_eq!(tracker.forget("sync-2"), None);
        assert!(cache.get(&job_key("sync-2")).is_some());
    }

    #[test]
    fn test_status_wire_format() {
        let status: JobStatus =
            serde_json::from_value(json!({"status": "running", "progress": 12.5})).unwrap();
        assert_eq!(status, JobStatus::Running { progress: Some(12.5) });
        assert!(!status.is_terminal());
        let failed: JobStatus =
            serde_json::from_value(json!({"status": "failed", "error": "bad csv"})).unwrap();
        assert!(failed.is_terminal());
    }
}
