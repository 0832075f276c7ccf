use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::cache::{CacheStore, QueryKey};
use crate::notifications::{Notification, NotificationAction, NotificationSink};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Default number of items sent per batch call.
const DEFAULT_BATCH_SIZE: usize = 10;

/// Default inactivity delay before a partial batch is flushed.
const DEFAULT_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl BatchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

pub type BatchFn<I> =
    Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;
pub type BatchKeysFn<I> = Arc<dyn Fn(&[I]) -> Vec<QueryKey> + Send + Sync>;
pub type BatchErrorCallback<I> = Arc<dyn Fn(&BatchError<I>) + Send + Sync>;

/// A whole batch failed. The items are handed back so the caller can
/// re-queue them.
#[derive(Debug, Error)]
#[error("batch of {} items failed: {error}", .items.len())]
pub struct BatchError<I> {
    pub items: Vec<I>,
    #[source]
    pub error: ApiError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome<I> {
    pub items: Vec<I>,
    pub results: Value,
    pub invalidated: Vec<QueryKey>,
}

pub struct BatchOptions<I> {
    config: BatchConfig,
    batch_fn: BatchFn<I>,
    keys_fn: BatchKeysFn<I>,
    retry: RetryPolicy,
    on_error: Option<BatchErrorCallback<I>>,
}

impl<I: 'static> BatchOptions<I> {
    pub fn new<F, Fut>(batch_fn: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        Self {
            config: BatchConfig::default(),
            batch_fn: Arc::new(move |items| batch_fn(items).boxed()),
            keys_fn: Arc::new(|_| Vec::new()),
            retry: RetryPolicy::default(),
            on_error: None,
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Keys to invalidate after a batch succeeds.
    pub fn invalidates<F>(mut self, keys_fn: F) -> Self
    where
        F: Fn(&[I]) -> Vec<QueryKey> + Send + Sync + 'static,
    {
        self.keys_fn = Arc::new(keys_fn);
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    /// Called for failed batches, including ones flushed by the timer.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BatchError<I>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

struct BatchState<I> {
    queue: VecDeque<I>,
    /// Items at the front of the queue already promised to a spawned full
    /// flush that has not drained them yet.
    claimed: usize,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced so a superseded timer task
    /// that already woke up does nothing.
    timer_generation: u64,
}

impl<I> BatchState<I> {
    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct BatchInner<I> {
    cache: CacheStore,
    options: BatchOptions<I>,
    sink: Option<Arc<dyn NotificationSink>>,
    state: Mutex<BatchState<I>>,
    /// Keeps batches going out one at a time, in queue order.
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Groups individually issued writes into batch calls.
///
/// A flush happens when `batch_size` items are queued or `delay_ms` has
/// passed since the last `add_to_batch`, whichever comes first. Each batch
/// call succeeds or fails as a whole.
pub struct BatchQueue<I> {
    inner: Arc<BatchInner<I>>,
}

impl<I> Clone for BatchQueue<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I> BatchQueue<I>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(cache: CacheStore, options: BatchOptions<I>) -> Self {
        Self::build(cache, options, None)
    }

    pub fn with_sink(
        cache: CacheStore,
        options: BatchOptions<I>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::build(cache, options, Some(sink))
    }

    fn build(
        cache: CacheStore,
        options: BatchOptions<I>,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                cache,
                options,
                sink,
                state: Mutex::new(BatchState {
                    queue: VecDeque::new(),
                    claimed: 0,
                    timer: None,
                    timer_generation: 0,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.options.config
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Queue an item. Must be called inside a tokio runtime.
    pub fn add_to_batch(&self, item: I) {
        let batch_size = self.inner.options.config.batch_size;
        let full = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(item);
            state.cancel_timer();
            let full = state.queue.len().saturating_sub(state.claimed) >= batch_size;
            if full {
                state.claimed += batch_size;
            } else {
                self.schedule_flush(&mut state);
            }
            full
        };
        if full {
            debug!(batch_size, "Batch full, flushing");
            let this = self.clone();
            tokio::spawn(async move {
                // Failures are reported through the sink and on_error.
                let _ = this.flush_batch().await;
            });
        }
    }

    /// Send up to `batch_size` queued items now. `Ok(None)` when nothing
    /// was queued.
    pub async fn flush_batch(&self) -> Result<Option<BatchOutcome<I>>, BatchError<I>> {
        let _flushing = self.inner.flush_lock.lock().await;
        let items: Vec<I> = {
            let mut state = self.inner.state.lock();
            state.cancel_timer();
            let take = state.queue.len().min(self.inner.options.config.batch_size);
            state.claimed = state.claimed.saturating_sub(take);
            state.queue.drain(..take).collect()
        };
        if items.is_empty() {
            return Ok(None);
        }

        let result = self.process(items).await;

        {
            let mut state = self.inner.state.lock();
            let idle = state.timer.is_none() && !self.inner.shutdown.is_cancelled();
            if !state.queue.is_empty() && idle {
                debug!(remaining = state.queue.len(), "Scheduling follow-up flush");
                self.schedule_flush(&mut state);
            }
        }
        result.map(Some)
    }

    /// Stop the flush timer and any batch call still backing off. Queued
    /// items are dropped and returned.
    pub fn dispose(&self) -> Vec<I> {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        state.cancel_timer();
        state.claimed = 0;
        state.queue.drain(..).collect()
    }

    fn schedule_flush(&self, state: &mut BatchState<I>) {
        let generation = state.timer_generation;
        let delay = self.inner.options.config.delay();
        let this = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = this.inner.state.lock();
                if state.timer_generation != generation {
                    return;
                }
                state.timer = None;
            }
            let _ = this.flush_batch().await;
        }));
    }

    async fn process(&self, items: Vec<I>) -> Result<BatchOutcome<I>, BatchError<I>> {
        let inner = &self.inner;
        let executor = RetryExecutor::with_cancel_token(
            inner.options.retry.clone(),
            inner.shutdown.child_token(),
        );
        let batch_fn = inner.options.batch_fn.clone();
        let size = items.len();

        match executor.execute(|| batch_fn(items.clone())).await {
            Ok(results) => {
                let mut keys: Vec<QueryKey> = Vec::new();
                for key in (inner.options.keys_fn)(&items) {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                for key in &keys {
                    inner.cache.invalidate(key);
                }
                info!(items = size, invalidated = keys.len(), "Batch flushed");
                Ok(BatchOutcome {
                    items,
                    results,
                    invalidated: keys,
                })
            }
            Err(error) => {
                warn!(items = size, error = %error, "Batch failed");
                if let Some(sink) = &inner.sink {
                    let mut notice = Notification::error(
                        "Batch failed",
                        format!("{} changes could not be saved: {}", size, error),
                    );
                    if error.is_retryable() {
                        notice = notice.with_action(NotificationAction::Retry);
                    }
                    sink.add_notification(notice);
                }
                let failure = BatchError { items, error };
                if let Some(callback) = &inner.options.on_error {
                    callback(&failure);
                }
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::MemorySink;
    use crate::query_key;
    use crate::retry::RetryConfig;
    use serde_json::json;

    type Calls = Arc<Mutex<Vec<Vec<u32>>>>;

    fn recording_queue(cache: &CacheStore, config: BatchConfig) -> (BatchQueue<u32>, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = calls.clone();
        let options = BatchOptions::new(move |items: Vec<u32>| {
            recorder.lock().push(items.clone());
            async move { Ok(json!({ "saved": items.len() })) }
        })
        .with_config(config)
        .invalidates(|items: &[u32]| {
            let mut keys = vec![query_key!["grades"]];
            keys.extend(items.iter().map(|id| query_key!["grade", *id]));
            keys
        })
        .with_retry(RetryConfig::no_retry());
        (BatchQueue::new(cache.clone(), options), calls)
    }

    fn config(batch_size: usize, delay_ms: u64) -> BatchConfig {
        BatchConfig { batch_size, delay_ms }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_after_delay() {
        let (queue, calls) = recording_queue(&CacheStore::new(), config(10, 1000));
        queue.add_to_batch(1);
        queue.add_to_batch(2);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(calls.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*calls.lock(), vec![vec![1, 2]]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_add_restarts_delay() {
        let (queue, calls) = recording_queue(&CacheStore::new(), config(10, 1000));
        queue.add_to_batch(1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        queue.add_to_batch(2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(calls.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*calls.lock(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_immediately_at_batch_size() {
        let (queue, calls) = recording_queue(&CacheStore::new(), config(3, 60_000));
        for id in 1..=3 {
            queue.add_to_batch(id);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*calls.lock(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_items_flush_after_delay() {
        let (queue, calls) = recording_queue(&CacheStore::new(), config(2, 1000));
        for id in 1..=5 {
            queue.add_to_batch(id);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*calls.lock(), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(queue.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(calls.lock().len(), 3);
        assert_eq!(calls.lock()[2], vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_waits_full_delay() {
        let (queue, calls) = recording_queue(&CacheStore::new(), config(2, 1000));
        for id in 1..=5 {
            queue.add_to_batch(id);
        }

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(*calls.lock(), vec![vec![1, 2], vec![3, 4]]);

        queue.add_to_batch(6);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.lock().len(), 3);
        assert_eq!(calls.lock()[2], vec![5, 6]);
        assert_eq!(queue.pending_len(), 0);

        queue.add_to_batch(7);
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(calls.lock().len(), 3);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(calls.lock()[3], vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_invalidates_batch_keys() {
        let cache = CacheStore::new();
        cache.set(query_key!["grades"], json!([]));
        cache.set(query_key!["grade", 7], json!({ "score": 1 }));
        let (queue, _calls) = recording_queue(&cache, config(10, 1000));

        queue.add_to_batch(7);
        queue.add_to_batch(7);
        let outcome = queue.flush_batch().await.unwrap().unwrap();

        assert_eq!(outcome.items, vec![7, 7]);
        assert_eq!(outcome.results, json!({ "saved": 2 }));
        assert_eq!(outcome.invalidated, vec![query_key!["grades"], query_key!["grade", 7]]);
        assert!(cache.is_stale(&query_key!["grade", 7]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returns_items_and_invalidates_nothing() {
        let cache = CacheStore::new();
        cache.set(query_key!["grades"], json!([]));
        let sink = Arc::new(MemorySink::new());
        let options = BatchOptions::new(|_items: Vec<u32>| async {
            Err(ApiError::Validation("row 2 invalid".into()))
        })
        .invalidates(|_: &[u32]| vec![query_key!["grades"]]);
        let queue = BatchQueue::with_sink(cache.clone(), options, sink.clone());

        queue.add_to_batch(1);
        queue.add_to_batch(2);
        let err = queue.flush_batch().await.unwrap_err();

        assert_eq!(err.items, vec![1, 2]);
        assert_eq!(err.error, ApiError::Validation("row 2 invalid".into()));
        assert!(!cache.is_stale(&query_key!["grades"]));
        let notes = sink.drain();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].message.starts_with("2 changes could not be saved"));
        assert!(notes[0].actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_failure_reaches_callback() {
        let failed: Calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = failed.clone();
        let options = BatchOptions::new(|_items: Vec<u32>| async {
            Err(ApiError::Server { status: 503, message: "busy".into() })
        })
        .with_retry(RetryConfig::no_retry())
        .on_error(move |err: &BatchError<u32>| recorder.lock().push(err.items.clone()));
        let queue = BatchQueue::new(CacheStore::new(), options);

        queue.add_to_batch(9);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(*failed.lock(), vec![vec![9]]);
    }

    #[tokio::test]
    async fn test_flush_empty_queue() {
        let (queue, calls) = recording_queue(&CacheStore::new(), BatchConfig::default());
        assert!(queue.flush_batch().await.unwrap().is_none());
        assert!(calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_drops_timer() {
        let (queue, calls) = recording_queue(&CacheStore::new(), config(10, 1000));
        queue.add_to_batch(4);
        assert_eq!(queue.dispose(), vec![4]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config: BatchConfig = serde_json::from_str(r#"{"batch_size": 25}"#).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.delay_ms, DEFAULT_DELAY_MS);
    }
}
