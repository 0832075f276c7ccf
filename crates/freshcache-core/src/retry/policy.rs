use std::fmt;
use std::sync::Arc;

use super::RetryConfig;
use crate::api::ApiError;

/// Decides whether failed attempt `attempt` (0-based) may be retried.
pub type RetryCondition = Arc<dyn Fn(&ApiError, u32) -> bool + Send + Sync>;

/// Called before each backoff with the 1-based retry number.
pub type RetryHook = Arc<dyn Fn(u32, &ApiError) + Send + Sync>;

/// Called once when an operation fails for good.
pub type ExhaustedHook = Arc<dyn Fn(&ApiError) + Send + Sync>;

/// Default rule: no retries for 4xx other than 408/429, never for
/// validation failures; retry connection failures and 5xx.
pub fn default_retry_condition(error: &ApiError, _attempt: u32) -> bool {
    error.is_retryable()
}

/// A [`RetryConfig`] together with the callbacks that observe it.
#[derive(Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
    retry_condition: RetryCondition,
    on_retry: Option<RetryHook>,
    on_max_retries_reached: Option<ExhaustedHook>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .field("on_max_retries_reached", &self.on_max_retries_reached.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_condition: Arc::new(default_retry_condition),
            on_retry: None,
            on_max_retries_reached: None,
        }
    }

    pub fn with_config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ApiError, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }

    /// Replace the retry callback.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, &ApiError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Add a retry callback that runs after the existing one.
    pub fn and_on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, &ApiError) + Send + Sync + 'static,
    {
        let chained: RetryHook = match self.on_retry.take() {
            Some(existing) => Arc::new(move |attempt: u32, error: &ApiError| {
                existing(attempt, error);
                hook(attempt, error);
            }),
            None => Arc::new(hook),
        };
        self.on_retry = Some(chained);
        self
    }

    pub fn on_max_retries_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ApiError) + Send + Sync + 'static,
    {
        self.on_max_retries_reached = Some(Arc::new(hook));
        self
    }

    pub fn should_retry(&self, error: &ApiError, attempt: u32) -> bool {
        (self.retry_condition)(error, attempt)
    }

    pub(crate) fn notify_retry(&self, attempt: u32, error: &ApiError) {
        if let Some(hook) = &self.on_retry {
            hook(attempt, error);
        }
    }

    pub(crate) fn notify_exhausted(&self, error: &ApiError) {
        if let Some(hook) = &self.on_max_retries_reached {
            hook(error);
        }
    }
}
