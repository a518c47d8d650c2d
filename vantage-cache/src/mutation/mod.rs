//! Optimistic writes with exact rollback.
//!
//! Overlapping mutations are sequenced per key in issue order: a later
//! write is applied on top of an earlier write's speculative value, and a
//! failure only unwinds its own delta. Mutations over disjoint keys run
//! fully in parallel.

pub mod coordinator;
pub mod snapshot;

pub use coordinator::{Mutation, MutationCoordinator, PendingMutation, DEFAULT_FAILURE_MESSAGE};
pub use snapshot::MutationSnapshot;
