//! freshcache core library.
//!
//! Keeps a client-side cache of server-owned data consistent while the user
//! writes optimistically, the network fails transiently, and other actors
//! push changes.
//!
//! - `cache`: the shared `CacheStore` every other component writes to
//! - `retry`: backoff executor, bulk and network-aware variants
//! - `mutation`: optimistic mutations and the write-batching queue
//! - `realtime`: push channel, event routing, background refetch
//! - `jobs`: polling of long-running server jobs
//! - `api`: REST client and the `ApiError` taxonomy

pub mod api;
pub mod cache;
pub mod config;
pub mod jobs;
pub mod mutation;
pub mod notifications;
pub mod realtime;
pub mod retry;
pub mod session;

pub use api::{ApiClient, ApiError};
pub use cache::{CacheEntry, CacheError, CacheEvent, CacheStore, KeyPart, QueryKey};
pub use config::Config;
pub use jobs::{JobStatus, JobTracker};
pub use mutation::{
    BatchConfig, BatchError, BatchOptions, BatchQueue, MutationOptions, MutationOutcome,
    MutationStatus, OptimisticMutationCoordinator,
};
pub use notifications::{Notification, NotificationSink};
pub use realtime::{ChannelConfig, ChannelState, EventRouter, InboundEvent, RealTimeChannel};
pub use retry::{RetryConfig, RetryExecutor, RetryPolicy, RetryState};
pub use session::SessionData;
