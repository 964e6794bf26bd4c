//! Domain layer - Core types and state with no transport dependencies.

/// Portfolio positions, snapshots, and recalculation.
pub mod portfolio;

/// Price tick types and the coalescing update queue.
pub mod streaming;

/// Subscription tracking and resubscription bookkeeping.
pub mod subscription;
