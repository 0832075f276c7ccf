//! Retry with exponential backoff.
//!
//! This module provides:
//! - `RetryConfig` / `RetryPolicy`: backoff schedule plus retry callbacks
//! - `RetryExecutor`: the attempt loop with observable `RetryState`
//! - `BulkRetry`: independent operations under one policy
//! - `NetworkAwareRetry`: schedule adjusted to connection quality
//!
//! Delay before retry `k+1` is `min(base * factor^k, max_delay)` plus up to
//! `jitter_ms` of random jitter.

pub mod bulk;
pub mod config;
pub mod executor;
pub mod network;
pub mod policy;

pub use bulk::{BulkOperationFn, BulkOperationState, BulkRetry, BulkStatus, BulkSummary};
pub use config::RetryConfig;
pub use executor::{RetryExecutor, RetryState};
pub use network::{adjust_for_network, ConnectionQuality, NetworkAwareRetry, NetworkMonitor};
pub use policy::{default_retry_condition, ExhaustedHook, RetryCondition, RetryHook, RetryPolicy};
