use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use super::{RetryConfig, RetryExecutor, RetryPolicy};
use crate::api::ApiError;

/// Round trips slower than this count as a slow connection.
const SLOW_RTT_THRESHOLD: Duration = Duration::from_millis(1500);

/// Retry ceiling on slow connections.
const SLOW_MAX_RETRIES: u32 = 2;

/// Delay multiplier on slow connections.
const SLOW_DELAY_MULTIPLIER: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Offline,
    Slow,
    #[default]
    Good,
}

impl ConnectionQuality {
    /// Classify from an effective connection type (`"slow-2g"`, `"2g"`,
    /// `"3g"`, `"4g"`, ...) and the online flag.
    pub fn from_effective_type(online: bool, effective_type: &str) -> Self {
        if !online {
            return ConnectionQuality::Offline;
        }
        match effective_type.to_ascii_lowercase().as_str() {
            "slow-2g" | "2g" => ConnectionQuality::Slow,
            _ => ConnectionQuality::Good,
        }
    }

    pub fn from_round_trip(rtt: Duration) -> Self {
        if rtt > SLOW_RTT_THRESHOLD {
            ConnectionQuality::Slow
        } else {
            ConnectionQuality::Good
        }
    }
}

/// Retry schedule for the given connection quality: no retries offline,
/// fewer attempts with longer delays on slow links.
pub fn adjust_for_network(base: &RetryConfig, quality: ConnectionQuality) -> RetryConfig {
    match quality {
        ConnectionQuality::Good => base.clone(),
        ConnectionQuality::Offline => RetryConfig {
            max_retries: 0,
            ..base.clone()
        },
        ConnectionQuality::Slow => RetryConfig {
            max_retries: base.max_retries.min(SLOW_MAX_RETRIES),
            base_delay_ms: base.base_delay_ms.saturating_mul(SLOW_DELAY_MULTIPLIER),
            max_delay_ms: base.max_delay_ms.saturating_mul(SLOW_DELAY_MULTIPLIER),
            ..base.clone()
        },
    }
}

/// Publishes the current [`ConnectionQuality`].
/// Clone is cheap - clones publish to the same watchers.
#[derive(Clone)]
pub struct NetworkMonitor {
    quality: Arc<watch::Sender<ConnectionQuality>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(ConnectionQuality::Good)
    }
}

impl NetworkMonitor {
    pub fn new(initial: ConnectionQuality) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            quality: Arc::new(tx),
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        *self.quality.borrow()
    }

    pub fn set_quality(&self, quality: ConnectionQuality) {
        let previous = self.quality.send_replace(quality);
        if previous != quality {
            info!(from = ?previous, to = ?quality, "Connection quality changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionQuality> {
        self.quality.subscribe()
    }
}

/// Retry wrapper whose schedule follows the observed connection quality.
#[derive(Clone)]
pub struct NetworkAwareRetry {
    policy: RetryPolicy,
    monitor: NetworkMonitor,
}

impl NetworkAwareRetry {
    pub fn new(policy: impl Into<RetryPolicy>, monitor: NetworkMonitor) -> Self {
        Self {
            policy: policy.into(),
            monitor,
        }
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// The base policy with its config adjusted for the current quality.
    pub fn current_policy(&self) -> RetryPolicy {
        let config = adjust_for_network(&self.policy.config, self.monitor.quality());
        self.policy.clone().with_config(config)
    }

    pub fn executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.current_policy())
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.executor().execute(operation).await
    }
}
