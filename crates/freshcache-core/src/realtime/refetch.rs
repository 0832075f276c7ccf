//! Periodic safety-net invalidation.
//!
//! Push delivery is best effort, so a few high-value keys are re-invalidated
//! on a fixed schedule whether or not an event arrived for them.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheStore, QueryKey};
use crate::query_key;

/// Notifications, the current user's profile and dashboard aggregates.
pub fn default_refetch_keys() -> Vec<QueryKey> {
    vec![
        query_key!["notifications"],
        query_key!["user", "me"],
        query_key!["dashboard"],
    ]
}

/// Spawn the refetch task. Returns a CancellationToken that can be used to
/// stop the task.
pub fn spawn_background_refetch(
    cache: CacheStore,
    keys: Vec<QueryKey>,
    period: Duration,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        run_refetch_loop(cache, keys, period, cancel_clone).await;
    });

    cancel
}

async fn run_refetch_loop(
    cache: CacheStore,
    keys: Vec<QueryKey>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the cache was just loaded.
    ticker.tick().await;

    info!(interval_secs = period.as_secs(), keys = keys.len(), "Background refetch started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Background refetch shutting down");
                break;
            }
            _ = ticker.tick() => {
                for key in &keys {
                    cache.invalidate(key);
                }
                debug!(keys = keys.len(), "Background refetch invalidated keys");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEvent;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_invalidates_on_each_period() {
        let cache = CacheStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        cache.subscribe(QueryKey::default(), move |event| {
            if let CacheEvent::Invalidated(key) = event {
                recorder.lock().push(key.clone());
            }
        });

        let cancel =
            spawn_background_refetch(cache, default_refetch_keys(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*seen.lock(), default_refetch_keys());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(seen.lock().len(), 6);

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(seen.lock().len(), 6);
    }
}
