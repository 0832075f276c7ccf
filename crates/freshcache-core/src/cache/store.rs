use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::QueryKey;
use crate::api::ApiError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Read for {0} was cancelled")]
    Cancelled(QueryKey),

    #[error(transparent)]
    Fetch(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub value: Value,
    pub is_stale: bool,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(key: QueryKey, value: Value) -> Self {
        Self {
            key,
            value,
            is_stale: false,
            updated_at: Utc::now(),
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.updated_at
    }

    fn is_stale_after(&self, stale_after: Option<chrono::Duration>) -> bool {
        self.is_stale || stale_after.map(|limit| self.age() > limit).unwrap_or(false)
    }
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Updated(QueryKey),
    Invalidated(QueryKey),
    Removed(QueryKey),
}

impl CacheEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            CacheEvent::Updated(key)
            | CacheEvent::Invalidated(key)
            | CacheEvent::Removed(key) => key,
        }
    }
}

pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    key: QueryKey,
    listener: Listener,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

/// Clears this read's `in_flight` slot if its future is dropped before
/// settling. A newer read for the same key keeps its own slot.
struct InFlightGuard<'a> {
    inner: &'a Mutex<StoreInner>,
    key: &'a QueryKey,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.in_flight.get(self.key).map(|f| f.generation) == Some(self.generation) {
            inner.in_flight.remove(self.key);
        }
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    in_flight: HashMap<QueryKey, InFlight>,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    next_generation: u64,
}

/// In-memory key/value view of server state.
///
/// Every writer goes through `set`, `update`, `restore` or `invalidate`;
/// each of those runs under one lock, so concurrent optimistic patches never
/// clobber each other with a stale read-modify-write.
/// Clone is cheap - clones share the same underlying store.
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<StoreInner>>,
    stale_after: Option<chrono::Duration>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries older than `age` report stale even without invalidation.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = chrono::Duration::from_std(age).ok();
        self
    }

    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        let inner = self.inner.lock();
        inner.entries.get(key).map(|e| {
            let mut entry = e.clone();
            entry.is_stale = e.is_stale_after(self.stale_after);
            entry
        })
    }

    /// Missing entries count as stale.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| e.is_stale_after(self.stale_after))
            .unwrap_or(true)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn set(&self, key: QueryKey, value: Value) {
        self.inner
            .lock()
            .entries
            .insert(key.clone(), CacheEntry::new(key.clone(), value));
        debug!(key = %key, "Cache entry set");
        self.notify(CacheEvent::Updated(key));
    }

    /// Atomic read-modify-write; returns the value written.
    pub fn update<F>(&self, key: &QueryKey, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let value = {
            let mut inner = self.inner.lock();
            let value = f(inner.entries.get(key).map(|e| &e.value));
            inner
                .entries
                .insert(key.clone(), CacheEntry::new(key.clone(), value.clone()));
            value
        };
        debug!(key = %key, "Cache entry updated");
        self.notify(CacheEvent::Updated(key.clone()));
        value
    }

    /// Write a snapshot back. `None` means the key was absent and is removed.
    pub fn restore(&self, key: &QueryKey, snapshot: Option<Value>) {
        match snapshot {
            Some(value) => self.set(key.clone(), value),
            None => {
                self.remove(key);
            }
        }
    }

    pub fn remove(&self, key: &QueryKey) -> Option<Value> {
        let removed = self.inner.lock().entries.remove(key).map(|e| e.value);
        if removed.is_some() {
            self.notify(CacheEvent::Removed(key.clone()));
        }
        removed
    }

    pub fn clear(&self) {
        let keys: Vec<QueryKey> = {
            let mut inner = self.inner.lock();
            for (_, flight) in inner.in_flight.drain() {
                flight.cancel.cancel();
            }
            inner.entries.drain().map(|(key, _)| key).collect()
        };
        for key in keys {
            self.notify(CacheEvent::Removed(key));
        }
    }

    /// Mark every entry under `key` stale. Emits one `Invalidated(key)` event
    /// per call, even when nothing is cached yet, so subscribers can refetch.
    pub fn invalidate(&self, key: &QueryKey) -> usize {
        let marked = {
            let mut inner = self.inner.lock();
            let mut marked = 0;
            for entry in inner.entries.values_mut() {
                if entry.key.starts_with(key) {
                    entry.is_stale = true;
                    marked += 1;
                }
            }
            marked
        };
        debug!(key = %key, marked, "Cache invalidated");
        self.notify(CacheEvent::Invalidated(key.clone()));
        marked
    }

    /// Abort the in-flight read for `key`, if any. Its result is discarded.
    pub fn cancel_pending(&self, key: &QueryKey) -> bool {
        match self.inner.lock().in_flight.remove(key) {
            Some(flight) => {
                flight.cancel.cancel();
                debug!(key = %key, "Cancelled in-flight read");
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self, key: &QueryKey) -> bool {
        self.inner.lock().in_flight.contains_key(key)
    }

    /// Read through the cache: fresh entries are returned as-is, otherwise
    /// `fetcher` runs as the in-flight read for `key`. A newer read for the
    /// same key supersedes an older one.
    pub async fn fetch_query<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let (generation, cancel) = {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(key) {
                if !entry.is_stale_after(self.stale_after) {
                    return Ok(entry.value.clone());
                }
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            let cancel = CancellationToken::new();
            let previous = inner.in_flight.insert(
                key.clone(),
                InFlight {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            (generation, cancel)
        };
        let _guard = InFlightGuard {
            inner: &self.inner,
            key,
            generation,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled(key.clone())),
            result = fetcher() => result,
        };

        let mut inner = self.inner.lock();
        let current = inner
            .in_flight
            .get(key)
            .map(|f| f.generation == generation)
            .unwrap_or(false);
        if !current || cancel.is_cancelled() {
            return Err(CacheError::Cancelled(key.clone()));
        }
        inner.in_flight.remove(key);

        match result {
            Ok(value) => {
                inner
                    .entries
                    .insert(key.clone(), CacheEntry::new(key.clone(), value.clone()));
                drop(inner);
                debug!(key = %key, "Fetched into cache");
                self.notify(CacheEvent::Updated(key.clone()));
                Ok(value)
            }
            Err(e) => Err(CacheError::Fetch(e)),
        }
    }

    /// Listen to changes on keys overlapping `key` (prefix in either
    /// direction). The empty key observes everything. Listeners run
    /// synchronously on the writing task and must not block.
    pub fn subscribe<F>(&self, key: QueryKey, listener: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.subscriptions.push(Subscription {
            id,
            key,
            listener: Arc::new(listener),
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id.0);
        inner.subscriptions.len() != before
    }

    fn notify(&self, event: CacheEvent) {
        let listeners: Vec<Listener> = {
            let inner = self.inner.lock();
            inner
                .subscriptions
                .iter()
                .filter(|s| s.key.overlaps(event.key()))
                .map(|s| s.listener.clone())
                .collect()
        };
        for listener in listeners {
            listener(&event);
        }
    }
}
