//! Core domain types for the commit queue.

pub mod ids;
pub mod pending;
pub mod queue;

pub use ids::{IssueId, PatchsetId, Revision};
pub use pending::PendingCommit;
pub use queue::PendingQueue;
