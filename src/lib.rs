//! Commit queue: takes code-review patches with the commit flag set, runs a
//! set of independent verifiers over each one, and lands the patches that
//! pass, persisting in-flight state across restarts.
//!
//! This library provides the verification/aggregation engine, the verifier
//! implementations, and the collaborator interfaces (review service,
//! checkout, status sink). The binary wires concrete collaborators from a
//! project configuration and runs the control loop.

pub mod checkout;
pub mod config;
pub mod context;
pub mod manager;
pub mod notify;
pub mod persist;
pub mod review;
pub mod test_utils;
pub mod types;
pub mod verify;
