//! The verifier state lattice and the per-patch aggregate.
//!
//! Every verifier reports one of four states. The states are totally ordered
//! by severity, and the aggregate verdict for a patch is the *worst* state
//! across all of its verifications. The ordering is user-visible behavior,
//! not an implementation detail: a single IGNORED verification silently
//! vetoes a patch and wins over FAILED (which posts a rejection comment),
//! which wins over an undecided PROCESSING, which wins over SUCCEEDED.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::status::VerifierStatus;

/// The state of a single verification.
///
/// Order matters: aggregation takes the maximum, so variants must stay
/// declared from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VerifierState {
    /// The verifier is fine with committing this patch.
    Succeeded,

    /// No decision yet; the verifier is still running (possibly across
    /// several loop iterations for asynchronous checks).
    Processing,

    /// Verification failed. The patch must not be committed and the author
    /// is told why.
    Failed,

    /// The patch must be dropped without any comment on the review. Wins
    /// over every other state.
    Ignored,
}

impl VerifierState {
    /// Returns true if this state still allows the verification to change
    /// on a later iteration.
    pub fn is_pending(&self) -> bool {
        matches!(self, VerifierState::Processing)
    }
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerifierState::Succeeded => "succeeded",
            VerifierState::Processing => "processing",
            VerifierState::Failed => "failed",
            VerifierState::Ignored => "ignored",
        };
        write!(f, "{}", s)
    }
}

/// The set of verifications recorded for one pending patch.
///
/// Keys are verifier names; values are the status objects the verifiers
/// created. Statuses are owned by the map and never shared between patches.
#[derive(Debug, Default)]
pub struct Verified {
    verifications: BTreeMap<String, Box<dyn VerifierStatus>>,
}

impl Verified {
    pub fn new() -> Self {
        Verified {
            verifications: BTreeMap::new(),
        }
    }

    /// The combined state of all verifications: the maximum under
    /// SUCCEEDED < PROCESSING < FAILED < IGNORED. An empty set is
    /// PROCESSING (neither accepted nor rejected yet).
    pub fn get_state(&self) -> VerifierState {
        self.verifications
            .values()
            .map(|v| v.state())
            .max()
            .unwrap_or(VerifierState::Processing)
    }

    /// All non-empty error messages, concatenated with blank lines, in
    /// verifier-name order. None when no verification has a message.
    pub fn error_message(&self) -> Option<String> {
        let out: Vec<&str> = self
            .verifications
            .values()
            .filter_map(|v| v.error_message())
            .filter(|m| !m.is_empty())
            .collect();
        if out.is_empty() {
            None
        } else {
            Some(out.join("\n\n"))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.verifications.is_empty()
    }

    pub fn len(&self) -> usize {
        self.verifications.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.verifications.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn VerifierStatus> {
        self.verifications.get(name).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn VerifierStatus>> {
        self.verifications.get_mut(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, status: Box<dyn VerifierStatus>) {
        self.verifications.insert(name.into(), status);
    }

    /// Ensures a status exists for `name`, building one on first sight.
    pub fn ensure(
        &mut self,
        name: &str,
        build: impl FnOnce() -> Box<dyn VerifierStatus>,
    ) -> &mut Box<dyn VerifierStatus> {
        self.verifications
            .entry(name.to_string())
            .or_insert_with(build)
    }

    /// Drops every verification except `keep`.
    ///
    /// Used when a verifier returns IGNORED: the single IGNORED entry is
    /// retained so the issue is not re-fetched, while the other entries
    /// would only be noise.
    pub fn retain_only(&mut self, keep: &str) {
        self.verifications.retain(|name, _| name == keep);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn VerifierStatus)> {
        self.verifications
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}

impl Clone for Verified {
    fn clone(&self) -> Self {
        Verified {
            verifications: self
                .verifications
                .iter()
                .map(|(k, v)| (k.clone(), v.boxed_clone()))
                .collect(),
        }
    }
}

impl PartialEq for Verified {
    /// Compares by encoded form, so two aggregates are equal when every
    /// verification has the same variant and the same field values.
    fn eq(&self, other: &Self) -> bool {
        if self.verifications.len() != other.verifications.len() {
            return false;
        }
        self.verifications.iter().all(|(name, status)| {
            match (status.encode(), other.verifications.get(name).map(|o| o.encode())) {
                (Ok(a), Some(Ok(b))) => a == b,
                _ => false,
            }
        })
    }
}
