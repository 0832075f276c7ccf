//! REST API access.
//!
//! `ApiClient` performs single HTTP requests against the backing service and
//! maps failures to `ApiError`, whose classification drives every retry
//! decision in the crate.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
