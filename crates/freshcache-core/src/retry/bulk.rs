use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::{RetryExecutor, RetryPolicy};
use crate::api::ApiError;

pub type BulkOperationFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkStatus {
    Pending,
    Retrying,
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct BulkOperationState<T> {
    pub id: String,
    pub status: BulkStatus,
    /// Times this operation was re-submitted through `retry_failed`.
    pub retry_count: u32,
    pub result: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl BulkSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

struct BulkEntry<T> {
    operation: BulkOperationFn<T>,
    state: BulkOperationState<T>,
}

/// A set of independent operations sharing one retry policy.
///
/// Each operation keeps its own status. One operation failing never stops
/// the others; `retry_failed` re-runs only the ones currently in error.
pub struct BulkRetry<T> {
    policy: RetryPolicy,
    entries: Arc<Mutex<Vec<BulkEntry<T>>>>,
}

impl<T> BulkRetry<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(policy: impl Into<RetryPolicy>) -> Self {
        Self {
            policy: policy.into(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register an operation, replacing any previous one with the same id.
    pub fn add<F, Fut>(&self, id: impl Into<String>, operation: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let id = id.into();
        let operation: BulkOperationFn<T> = Arc::new(move || operation().boxed());
        let entry = BulkEntry {
            operation,
            state: BulkOperationState {
                id: id.clone(),
                status: BulkStatus::Pending,
                retry_count: 0,
                result: None,
                error: None,
            },
        };
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.state.id == id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.state.id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn statuses(&self) -> Vec<BulkOperationState<T>> {
        self.entries.lock().iter().map(|e| e.state.clone()).collect()
    }

    pub fn status(&self, id: &str) -> Option<BulkOperationState<T>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.state.id == id)
            .map(|e| e.state.clone())
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.state.status == BulkStatus::Error)
            .map(|e| e.state.id.clone())
            .collect()
    }

    /// Run every operation concurrently; settles when all have settled.
    pub async fn execute_all(&self) -> BulkSummary {
        let ids: Vec<String> = self.entries.lock().iter().map(|e| e.state.id.clone()).collect();
        self.run(ids).await
    }

    /// Re-submit only the operations currently in error.
    pub async fn retry_failed(&self) -> BulkSummary {
        let ids: Vec<String> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|e| e.state.status == BulkStatus::Error)
                .map(|e| {
                    e.state.retry_count += 1;
                    e.state.id.clone()
                })
                .collect()
        };
        if ids.is_empty() {
            return BulkSummary::default();
        }
        info!(count = ids.len(), "Retrying failed operations");
        self.run(ids).await
    }

    async fn run(&self, ids: Vec<String>) -> BulkSummary {
        let runs = ids.into_iter().filter_map(|id| {
            let operation = {
                let mut entries = self.entries.lock();
                let entry = entries.iter_mut().find(|e| e.state.id == id)?;
                entry.state.status = BulkStatus::Pending;
                entry.state.error = None;
                entry.operation.clone()
            };
            Some(self.run_one(id, operation))
        });
        let outcomes = join_all(runs).await;

        let mut summary = BulkSummary::default();
        for (id, ok) in outcomes {
            if ok {
                summary.succeeded.push(id);
            } else {
                summary.failed.push(id);
            }
        }
        if !summary.failed.is_empty() {
            warn!(
                succeeded = summary.succeeded.len(),
                failed = summary.failed.len(),
                "Bulk run finished with failures"
            );
        }
        summary
    }

    async fn run_one(&self, id: String, operation: BulkOperationFn<T>) -> (String, bool) {
        let entries = self.entries.clone();
        let retry_id = id.clone();
        let policy = self.policy.clone().and_on_retry(move |_, _| {
            set_status(&entries, &retry_id, BulkStatus::Retrying);
        });
        let executor = RetryExecutor::new(policy);

        let result = executor.execute(|| operation()).await;

        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.state.id == id) else {
            return (id, result.is_ok());
        };
        let ok = match result {
            Ok(value) => {
                entry.state.status = BulkStatus::Success;
                entry.state.result = Some(value);
                true
            }
            Err(error) => {
                entry.state.status = BulkStatus::Error;
                entry.state.error = Some(error);
                false
            }
        };
        (id, ok)
    }
}

fn set_status<T>(entries: &Mutex<Vec<BulkEntry<T>>>, id: &str, status: BulkStatus) {
    if let Some(entry) = entries.lock().iter_mut().find(|e| e.state.id == id) {
        entry.state.status = status;
    }
}
