use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RetryPolicy;
use crate::api::ApiError;

/// The countdown in [`RetryState::next_retry_in`] ticks once per second.
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Observable progress of the current `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    /// Completed attempts in this run.
    pub attempt: u32,
    pub is_retrying: bool,
    /// Whole seconds until the next attempt starts.
    pub next_retry_in: u64,
    pub can_retry: bool,
    pub last_error: Option<ApiError>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 0,
            is_retrying: false,
            next_retry_in: 0,
            can_retry: true,
            last_error: None,
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Runs an async operation under a [`RetryPolicy`].
///
/// At most `max_retries + 1` attempts are made. Between attempts the
/// executor sleeps for the jittered backoff while publishing a per-second
/// countdown. `cancel()` interrupts a pending backoff so no late attempt
/// runs after the owner is gone.
pub struct RetryExecutor {
    policy: RetryPolicy,
    state: watch::Sender<RetryState>,
    cancel: Mutex<CancellationToken>,
}

impl RetryExecutor {
    pub fn new(policy: impl Into<RetryPolicy>) -> Self {
        Self::with_cancel_token(policy, CancellationToken::new())
    }

    /// Tie the executor to an owner's token; cancelling it stops backoff.
    pub fn with_cancel_token(policy: impl Into<RetryPolicy>, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(RetryState::default());
        Self {
            policy: policy.into(),
            state,
            cancel: Mutex::new(cancel),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> RetryState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RetryState> {
        self.state.subscribe()
    }

    /// Stop any pending backoff; the running `execute` returns `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
        self.state.send_modify(|s| {
            s.is_retrying = false;
            s.next_retry_in = 0;
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }

    /// Clear state and re-arm after `cancel()`.
    pub fn reset(&self) {
        *self.cancel.lock() = CancellationToken::new();
        self.state.send_replace(RetryState::default());
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let cancel = self.cancel.lock().clone();
        let config = &self.policy.config;
        self.state.send_replace(RetryState::default());

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    self.state.send_replace(RetryState::default());
                    return Ok(value);
                }
                Err(error) => error,
            };

            let completed = attempt + 1;
            let retryable = self.policy.should_retry(&error, attempt);
            if !retryable || attempt >= config.max_retries {
                self.state.send_modify(|s| {
                    s.attempt = completed;
                    s.is_retrying = false;
                    s.next_retry_in = 0;
                    s.can_retry = false;
                    s.last_error = Some(error.clone());
                });
                if retryable {
                    warn!(attempts = completed, error = %error, "Retries exhausted");
                } else {
                    debug!(attempts = completed, error = %error, "Error is not retryable");
                }
                self.policy.notify_exhausted(&error);
                return Err(error);
            }

            let delay = config.jittered_delay(attempt);
            self.state.send_modify(|s| {
                s.attempt = completed;
                s.is_retrying = true;
                s.can_retry = true;
                s.next_retry_in = ceil_secs(delay);
                s.last_error = Some(error.clone());
            });
            warn!(
                attempt = completed,
                max_attempts = config.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, backing off"
            );
            self.policy.notify_retry(completed, &error);

            if !self.countdown(delay, &cancel).await {
                debug!(attempt = completed, "Retry cancelled during backoff");
                return Err(ApiError::Cancelled);
            }
            attempt += 1;
        }
    }

    /// One user-triggered attempt outside the automatic loop. Not gated by
    /// `can_retry`.
    pub async fn manual_retry<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        info!("Manual retry requested");
        self.state.send_modify(|s| {
            s.is_retrying = true;
            s.next_retry_in = 0;
        });
        match operation().await {
            Ok(value) => {
                self.state.send_replace(RetryState::default());
                Ok(value)
            }
            Err(error) => {
                warn!(error = %error, "Manual retry failed");
                self.state.send_modify(|s| {
                    s.attempt = s.attempt.saturating_add(1);
                    s.is_retrying = false;
                    s.last_error = Some(error.clone());
                });
                Err(error)
            }
        }
    }

    /// Sleep `delay`, updating `next_retry_in` each second. Returns false
    /// if cancelled first.
    async fn countdown(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.state.send_modify(|s| s.next_retry_in = ceil_secs(remaining));
            if remaining.is_zero() {
                return true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.state.send_modify(|s| {
                        s.is_retrying = false;
                        s.next_retry_in = 0;
                    });
                    return false;
                }
                _ = sleep(remaining.min(COUNTDOWN_TICK)) => {}
            }
        }
    }
}
