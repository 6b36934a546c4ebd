//! The root aggregate: every patch currently under consideration.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::types::{IssueId, PendingCommit};

/// The queue of pending commits, plus the metadata needed to make polling
/// cheap across restarts. This is the unit of crash recovery: a persisted
/// snapshot must restore to an equivalent queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingQueue {
    /// Patches under verification, in admission order.
    pub pending_commits: Vec<PendingCommit>,

    /// Issues permanently vetoed by a pre-patch verifier (IGNORED). Kept so
    /// the same issue is not re-fetched and re-verified on every scan.
    pub ignored_issues: BTreeSet<IssueId>,

    /// When discovery last completed.
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue::default()
    }

    pub fn len(&self) -> usize {
        self.pending_commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_commits.is_empty()
    }

    pub fn contains_issue(&self, issue: IssueId) -> bool {
        self.pending_commits.iter().any(|p| p.issue == issue)
    }

    pub fn position_of(&self, issue: IssueId) -> Option<usize> {
        self.pending_commits.iter().position(|p| p.issue == issue)
    }

    pub fn get(&self, issue: IssueId) -> Option<&PendingCommit> {
        self.pending_commits.iter().find(|p| p.issue == issue)
    }
}

impl fmt::Display for PendingQueue {
    /// Human-readable summary for `--query-only`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} pending commit(s)", self.pending_commits.len())?;
        for pending in &self.pending_commits {
            writeln!(
                f,
                "  issue {} patchset {} by {}: {}",
                pending.issue,
                pending.patchset,
                pending.owner,
                pending.state()
            )?;
            for (name, status) in pending.verified.iter() {
                writeln!(f, "    {}: {}", name, status.state())?;
            }
        }
        if !self.ignored_issues.is_empty() {
            let ignored: Vec<String> =
                self.ignored_issues.iter().map(|i| i.to_string()).collect();
            writeln!(f, "  ignored issues: {}", ignored.join(", "))?;
        }
        Ok(())
    }
}
