use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::cache::{CacheStore, QueryKey};
use crate::notifications::{Notification, NotificationAction, NotificationSink};
use crate::retry::{RetryExecutor, RetryPolicy};

pub type MutationFn<V> =
    Arc<dyn Fn(V) -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;
pub type OptimisticUpdateFn<V> = Arc<dyn Fn(Option<&Value>, &V) -> Value + Send + Sync>;
pub type KeyFn<V> = Arc<dyn Fn(&V) -> QueryKey + Send + Sync>;
pub type SuccessCallback<V> = Arc<dyn Fn(&Value, &V) + Send + Sync>;
pub type ErrorCallback<V> = Arc<dyn Fn(&ApiError, &V) + Send + Sync>;

/// Default text of the rollback notice when no error message is configured.
const DEFAULT_ERROR_MESSAGE: &str = "Your change could not be saved";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

/// A mutation between its optimistic write and settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationContext {
    pub id: MutationId,
    pub query_key: QueryKey,
    /// Cache value right before this mutation's optimistic write.
    pub previous_snapshot: Option<Value>,
    pub optimistic_value: Value,
    pub status: MutationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub id: MutationId,
    pub query_key: QueryKey,
    pub status: MutationStatus,
    pub result: Result<Value, ApiError>,
}

impl MutationOutcome {
    pub fn is_committed(&self) -> bool {
        self.status == MutationStatus::Committed
    }
}

/// What a write does to the cache and to the server.
pub struct MutationOptions<V> {
    key_fn: KeyFn<V>,
    mutation_fn: MutationFn<V>,
    optimistic_update: OptimisticUpdateFn<V>,
    retry: RetryPolicy,
    success_message: Option<String>,
    error_message: Option<String>,
    rollback_delay: Duration,
    on_success: Option<SuccessCallback<V>>,
    on_error: Option<ErrorCallback<V>>,
}

impl<V: 'static> MutationOptions<V> {
    pub fn new<M, Fut, U>(query_key: QueryKey, mutation_fn: M, optimistic_update: U) -> Self
    where
        M: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
        U: Fn(Option<&Value>, &V) -> Value + Send + Sync + 'static,
    {
        Self {
            key_fn: Arc::new(move |_| query_key.clone()),
            mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
            optimistic_update: Arc::new(optimistic_update),
            retry: RetryPolicy::default(),
            success_message: None,
            error_message: None,
            rollback_delay: Duration::ZERO,
            on_success: None,
            on_error: None,
        }
    }

    /// Derive the target key from the variables instead of a fixed key.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&V) -> QueryKey + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Hold the optimistic value this long after a failure before rolling back.
    pub fn with_rollback_delay(mut self, delay: Duration) -> Self {
        self.rollback_delay = delay;
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value, &V) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ApiError, &V) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

struct PendingLink<V> {
    id: MutationId,
    variables: V,
    snapshot: Option<Value>,
    optimistic: Value,
    /// Confirmed by the server while an older mutation on the key was
    /// still pending. Kept so that mutation's rollback re-applies it.
    committed: bool,
}

/// Drop committed links that no pending mutation sits below.
fn prune_committed<V>(chain: &mut Vec<PendingLink<V>>) {
    let settled = chain.iter().take_while(|link| link.committed).count();
    chain.drain(..settled);
}

#[derive(Default)]
struct CoordinatorState<V> {
    /// Pending mutations per key, oldest first.
    chains: HashMap<QueryKey, Vec<PendingLink<V>>>,
    error_counts: HashMap<QueryKey, u32>,
}

struct CoordinatorInner<V> {
    cache: CacheStore,
    options: MutationOptions<V>,
    sink: Option<Arc<dyn NotificationSink>>,
    state: Mutex<CoordinatorState<V>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to a mutation whose server write is in flight.
pub struct PendingMutation {
    id: MutationId,
    query_key: QueryKey,
    handle: JoinHandle<MutationOutcome>,
}

impl PendingMutation {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    pub async fn settled(self) -> MutationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(mutation = %self.id, error = %e, "Mutation task ended abnormally");
                MutationOutcome {
                    id: self.id,
                    query_key: self.query_key,
                    status: MutationStatus::Pending,
                    result: Err(ApiError::Cancelled),
                }
            }
        }
    }
}

/// Applies writes to the cache immediately, then reconciles with the server.
///
/// Each mutation snapshots the cache value it overwrites. Mutations on the
/// same key chain: a later mutation's snapshot is the earlier one's
/// optimistic value. On failure a mutation restores its own snapshot; if
/// newer mutations are still pending on that key they are re-applied on top
/// of it, so a rollback never erases a later optimistic write. A newer
/// mutation that commits while an older one is pending stays in the chain
/// until the older one settles, and the key is marked stale if it had to be
/// re-applied.
///
/// Cache writes happen under the coordinator lock; cache listeners must not
/// call back into the coordinator.
pub struct OptimisticMutationCoordinator<V> {
    inner: Arc<CoordinatorInner<V>>,
}

impl<V> Clone for OptimisticMutationCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> OptimisticMutationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: CacheStore, options: MutationOptions<V>) -> Self {
        Self::build(cache, options, None)
    }

    pub fn with_sink(
        cache: CacheStore,
        options: MutationOptions<V>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::build(cache, options, Some(sink))
    }

    fn build(
        cache: CacheStore,
        options: MutationOptions<V>,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                options,
                sink,
                state: Mutex::new(CoordinatorState {
                    chains: HashMap::new(),
                    error_counts: HashMap::new(),
                }),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Apply the optimistic value now and start the server write.
    ///
    /// When this returns, the cache already holds the optimistic value.
    pub fn mutate(&self, variables: V) -> PendingMutation {
        let context = self.begin(&variables);
        let id = context.id;
        let query_key = context.query_key.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.settle(context, variables).await });
        PendingMutation {
            id,
            query_key,
            handle,
        }
    }

    pub async fn mutate_async(&self, variables: V) -> MutationOutcome {
        self.mutate(variables).settled().await
    }

    /// Mutations still waiting on the server, oldest first per key.
    pub fn pending(&self) -> Vec<MutationContext> {
        let state = self.inner.state.lock();
        let mut contexts: Vec<MutationContext> = state
            .chains
            .iter()
            .flat_map(|(key, chain)| {
                chain
                    .iter()
                    .filter(|link| !link.committed)
                    .map(move |link| MutationContext {
                        id: link.id,
                        query_key: key.clone(),
                        previous_snapshot: link.snapshot.clone(),
                        optimistic_value: link.optimistic.clone(),
                        status: MutationStatus::Pending,
                    })
            })
            .collect();
        contexts.sort_by_key(|c| c.id);
        contexts
    }

    pub fn pending_count(&self, key: &QueryKey) -> usize {
        self.inner
            .state
            .lock()
            .chains
            .get(key)
            .map(|chain| chain.iter().filter(|link| !link.committed).count())
            .unwrap_or(0)
    }

    /// Rollbacks on `key` since its last successful commit.
    pub fn error_count(&self, key: &QueryKey) -> u32 {
        self.inner
            .state
            .lock()
            .error_counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Forget the rollback count of `key`, returning it.
    pub fn reset_error_count(&self, key: &QueryKey) -> u32 {
        self.inner.state.lock().error_counts.remove(key).unwrap_or(0)
    }

    /// Stop backoff timers of every in-flight mutation. Interrupted
    /// mutations roll back without callbacks or notifications.
    pub fn dispose(&self) {
        debug!("Disposing mutation coordinator");
        self.inner.shutdown.cancel();
    }

    fn begin(&self, variables: &V) -> MutationContext {
        let inner = &self.inner;
        let key = (inner.options.key_fn)(variables);
        inner.cache.cancel_pending(&key);
        let id = MutationId(inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let mut state = inner.state.lock();
        let mut snapshot = None;
        let optimistic = inner.cache.update(&key, |old| {
            snapshot = old.cloned();
            (inner.options.optimistic_update)(old, variables)
        });
        let chain = state.chains.entry(key.clone()).or_default();
        chain.push(PendingLink {
            id,
            variables: variables.clone(),
            snapshot: snapshot.clone(),
            optimistic: optimistic.clone(),
            committed: false,
        });
        debug!(mutation = %id, key = %key, pending = chain.len(), "Optimistic value applied");

        MutationContext {
            id,
            query_key: key,
            previous_snapshot: snapshot,
            optimistic_value: optimistic,
            status: MutationStatus::Pending,
        }
    }

    async fn settle(self, context: MutationContext, variables: V) -> MutationOutcome {
        let inner = &self.inner;
        let executor =
            RetryExecutor::with_cancel_token(self.retry_policy(), inner.shutdown.child_token());
        let mutation_fn = inner.options.mutation_fn.clone();

        let result = executor.execute(|| mutation_fn(variables.clone())).await;

        let status = match &result {
            Ok(data) => {
                self.commit(&context, data, &variables);
                MutationStatus::Committed
            }
            Err(error) => {
                let disposed = *error == ApiError::Cancelled && inner.shutdown.is_cancelled();
                let delay = inner.options.rollback_delay;
                if !delay.is_zero() && !disposed {
                    tokio::time::sleep(delay).await;
                }
                self.rollback(&context, &variables, error, disposed);
                MutationStatus::RolledBack
            }
        };

        MutationOutcome {
            id: context.id,
            query_key: context.query_key,
            status,
            result,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        let policy = self.inner.options.retry.clone();
        let Some(sink) = self.inner.sink.clone() else {
            return policy;
        };
        let max_retries = policy.config.max_retries;
        policy.and_on_retry(move |attempt, error| {
            sink.add_notification(
                Notification::info(
                    "Retrying…",
                    format!("Retrying… attempt {} of {}", attempt, max_retries),
                )
                .with_metadata(json!({ "error": error.to_string() })),
            );
        })
    }

    fn commit(&self, context: &MutationContext, data: &Value, variables: &V) {
        let inner = &self.inner;
        let key = &context.query_key;
        {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            if let Some(chain) = state.chains.get_mut(key) {
                if let Some(link) = chain.iter_mut().find(|link| link.id == context.id) {
                    link.committed = true;
                }
                prune_committed(chain);
                if chain.is_empty() {
                    state.chains.remove(key);
                }
            }
            state.error_counts.remove(key);
        }

        // The optimistic value is provisional; force a fresh read.
        inner.cache.invalidate(key);
        info!(mutation = %context.id, key = %key, "Mutation committed");

        if let (Some(sink), Some(message)) = (&inner.sink, &inner.options.success_message) {
            sink.add_notification(Notification::success("Saved", message.clone()));
        }
        if let Some(callback) = &inner.options.on_success {
            callback(data, variables);
        }
    }

    fn rollback(&self, context: &MutationContext, variables: &V, error: &ApiError, silent: bool) {
        let inner = &self.inner;
        let key = &context.query_key;
        {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let mut emptied = false;
            if let Some(chain) = state.chains.get_mut(key) {
                if let Some(pos) = chain.iter().position(|link| link.id == context.id) {
                    let link = chain.remove(pos);
                    if pos == chain.len() {
                        inner.cache.restore(key, link.snapshot);
                    } else {
                        // Re-apply the newer mutations on top of our snapshot.
                        let mut base = link.snapshot;
                        let kept_commit = chain[pos..].iter().any(|later| later.committed);
                        for later in chain[pos..].iter_mut() {
                            later.snapshot = base.clone();
                            later.optimistic =
                                (inner.options.optimistic_update)(base.as_ref(), &later.variables);
                            base = Some(later.optimistic.clone());
                        }
                        inner.cache.restore(key, base);
                        if kept_commit {
                            // The server holds a newer write; the rebased value is a guess.
                            inner.cache.invalidate(key);
                        }
                        debug!(
                            mutation = %context.id,
                            rebased = chain.len() - pos,
                            kept_commit,
                            "Rebased newer mutations"
                        );
                    }
                }
                prune_committed(chain);
                emptied = chain.is_empty();
            }
            if emptied {
                state.chains.remove(key);
            }
            *state.error_counts.entry(key.clone()).or_insert(0) += 1;
        }

        if silent {
            debug!(mutation = %context.id, key = %key, "Mutation rolled back on dispose");
            return;
        }
        warn!(mutation = %context.id, key = %key, error = %error, "Mutation rolled back");

        if let Some(sink) = &inner.sink {
            let lead = inner
                .options
                .error_message
                .as_deref()
                .unwrap_or(DEFAULT_ERROR_MESSAGE);
            let mut notice =
                Notification::error("Changes reverted", format!("{}: {}", lead, error));
            if error.is_retryable() {
                notice = notice.with_action(NotificationAction::Retry);
            }
            sink.add_notification(notice);
        }
        if let Some(callback) = &inner.options.on_error {
            callback(error, variables);
        }
    }
}
