//! Status objects recorded by verifiers.
//!
//! Each verifier attaches one status object per pending patch. Most
//! verifiers only need [`SimpleStatus`]; verifiers with richer payloads
//! (try jobs, tree status) define their own types next to the verifier and
//! implement [`VerifierStatus`] for them.
//!
//! Statuses are plain serializable data: they persist with the queue and
//! are restored through the status registry (see `persist::registry`), which
//! maps the serialized type tag back to a concrete type. Any new status type
//! must be registered there or restoring a snapshot containing it fails.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::persist::registry::encode_tagged;
use crate::persist::PersistError;

use super::state::VerifierState;

/// One verifier's outcome for one pending patch.
pub trait VerifierStatus: fmt::Debug + Send + Sync {
    /// Stable tag identifying the concrete type in serialized form.
    fn type_tag(&self) -> &'static str;

    /// Current state in the four-state lattice.
    fn state(&self) -> VerifierState;

    /// Explanation attached to a FAILED (or, with context, IGNORED) state.
    fn error_message(&self) -> Option<&str>;

    /// Serializes to a tagged JSON object.
    fn encode(&self) -> Result<serde_json::Value, PersistError>;

    fn boxed_clone(&self) -> Box<dyn VerifierStatus>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn VerifierStatus> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Status for plain pass/fail verifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStatus {
    pub state: VerifierState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SimpleStatus {
    pub const TAG: &'static str = "simple";

    pub fn new(state: VerifierState) -> Self {
        SimpleStatus {
            state,
            error_message: None,
        }
    }

    pub fn succeeded() -> Self {
        SimpleStatus::new(VerifierState::Succeeded)
    }

    pub fn processing() -> Self {
        SimpleStatus::new(VerifierState::Processing)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        SimpleStatus {
            state: VerifierState::Failed,
            error_message: Some(message.into()),
        }
    }

    pub fn ignored() -> Self {
        SimpleStatus::new(VerifierState::Ignored)
    }
}

impl VerifierStatus for SimpleStatus {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn state(&self) -> VerifierState {
        self.state
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn encode(&self) -> Result<serde_json::Value, PersistError> {
        encode_tagged(Self::TAG, self)
    }

    fn boxed_clone(&self) -> Box<dyn VerifierStatus> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
