//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds (e.g.,
//! passing a patchset id where an issue id is expected) and make signatures
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A code-review issue number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub u64);

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for IssueId {
    fn from(n: u64) -> Self {
        IssueId(n)
    }
}

/// A patchset number within an issue. Patchsets are ordered; a larger number
/// supersedes a smaller one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchsetId(pub u64);

impl fmt::Display for PatchsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PatchsetId {
    fn from(n: u64) -> Self {
        PatchsetId(n)
    }
}

/// A version-control revision as reported by the checkout.
///
/// Opaque to the queue: a subversion revision number, a git SHA, or whatever
/// the configured checkout returns from `prepare`/`commit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(s: impl Into<String>) -> Self {
        Revision(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Revision(s.to_string())
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Revision(s)
    }
}
