//! In-memory cache of server state.
//!
//! This module provides the `CacheStore` shared by every other component.
//! Entries are addressed by hierarchical `QueryKey`s, hold opaque JSON
//! values, and carry a staleness flag set by invalidation.
//!
//! Writers use the atomic primitives:
//! - `set` / `update` / `restore` for direct and optimistic writes
//! - `invalidate` to mark a key (and everything under it) stale
//! - `cancel_pending` to abort a superseded in-flight read

pub mod key;
pub mod store;

pub use key::{KeyPart, QueryKey};
pub use store::{CacheEntry, CacheError, CacheEvent, CacheStore, Listener, SubscriptionId};
