//! Write paths.
//!
//! - `OptimisticMutationCoordinator`: apply a provisional value to the cache
//!   now, then commit (invalidate) or roll back once the server answers.
//! - `BatchQueue`: group many small writes into fewer all-or-nothing calls.

pub mod batch;
pub mod optimistic;

pub use batch::{BatchConfig, BatchError, BatchOptions, BatchOutcome, BatchQueue};
pub use optimistic::{
    MutationContext, MutationFn, MutationId, MutationOptions, MutationOutcome, MutationStatus,
    OptimisticMutationCoordinator, OptimisticUpdateFn, PendingMutation,
};
