//! The verifier protocol.
//!
//! A verifier is one independent check contributing one state to a patch's
//! aggregate verdict. Checks that finish immediately decide inside
//! [`Verifier::verify`]; checks backed by an external asynchronous process
//! (try jobs, tree status) record a PROCESSING status there and advance it
//! from [`Verifier::update_status`] on later loop iterations.
//!
//! The pending manager holds verifiers as trait objects and never branches
//! on concrete type.

pub mod authors;
pub mod fake;
pub mod presubmit;
pub mod project_base;
pub mod reviewer;
pub mod state;
pub mod status;
pub mod tree_status;
pub mod try_job;

pub use state::{Verified, VerifierState};
pub use status::{SimpleStatus, VerifierStatus};

use async_trait::async_trait;
use thiserror::Error;

use crate::checkout::CheckoutError;
use crate::review::ReviewError;
use crate::types::{IssueId, PendingCommit};

/// Signal that a pending patch can never succeed and must be removed from
/// the queue: wrong target, patch does not apply, superseded, and so on.
///
/// A `None` message removes the patch without notifying the author.
#[derive(Debug, Clone, Error)]
#[error("issue {issue} discarded")]
pub struct DiscardPending {
    pub issue: IssueId,
    pub message: Option<String>,
}

impl DiscardPending {
    pub fn new(issue: IssueId, message: impl Into<String>) -> Self {
        DiscardPending {
            issue,
            message: Some(message.into()),
        }
    }

    /// Discard without author notification.
    pub fn silent(issue: IssueId) -> Self {
        DiscardPending {
            issue,
            message: None,
        }
    }
}

/// Errors surfacing from a verifier run.
///
/// Only [`VerifyError::Discard`] mutates the queue; everything else is
/// treated as transient by the pending manager: logged, and retried on the
/// next loop iteration.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Discard(#[from] DiscardPending),

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    TryServer(#[from] try_job::TryServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One verification check.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Unique, stable name. Keys the verification map and the persisted
    /// snapshot.
    fn name(&self) -> &'static str;

    /// Verifies one pending patch. For post-patch verifiers the patch is
    /// already applied to the checkout when this runs. Must record a status
    /// under `self.name()` before returning Ok.
    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError>;

    /// Advances asynchronous checks for the whole queue. Called every loop
    /// iteration, independent of checkout state; must be idempotent and
    /// side-effect-free beyond updating verification state.
    async fn update_status(&self, queue: &mut [PendingCommit]) -> Result<(), VerifyError>;

    /// Timing gate, distinct from pass/fail: returning true delays the
    /// commit of an already-approved patch. Polled repeatedly until false.
    async fn postpone(&self, _pending: &PendingCommit) -> bool {
        false
    }
}

/// Attaches a freshly built status to every queue item lacking one for
/// `name`, then yields the items to act on: all of them, or (with
/// `pending_only`) only those whose status for `name` is still PROCESSING;
/// skipping already-decided items avoids redundant re-verification.
pub fn with_status<'a, F>(
    name: &'static str,
    queue: &'a mut [PendingCommit],
    build: F,
    pending_only: bool,
) -> impl Iterator<Item = &'a mut PendingCommit>
where
    F: Fn() -> Box<dyn VerifierStatus> + 'a,
{
    queue.iter_mut().filter_map(move |pending| {
        pending.verified.ensure(name, &build);
        let state = pending.verified.get(name).map(|s| s.state());
        if !pending_only || state == Some(VerifierState::Processing) {
            Some(pending)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueId, PatchsetId};

    fn pending(issue: u64) -> PendingCommit {
        PendingCommit::new(
            IssueId(issue),
            "a@example.com",
            vec![],
            PatchsetId(1),
            "",
            "d",
            vec![],
        )
    }

    #[test]
    fn with_status_attaches_missing_statuses() {
        let mut queue = vec![pending(1), pending(2)];
        let yielded: Vec<IssueId> = with_status(
            "check",
            &mut queue,
            || Box::new(SimpleStatus::processing()),
            false,
        )
        .map(|p| p.issue)
        .collect();
        assert_eq!(yielded, vec![IssueId(1), IssueId(2)]);
        assert!(queue.iter().all(|p| p.verified.contains("check")));
    }

    #[test]
    fn pending_only_skips_decided_items() {
        let mut queue = vec![pending(1), pending(2)];
        queue[0]
            .verified
            .insert("check", Box::new(SimpleStatus::succeeded()));

        let yielded: Vec<IssueId> = with_status(
            "check",
            &mut queue,
            || Box::new(SimpleStatus::processing()),
            true,
        )
        .map(|p| p.issue)
        .collect();
        // Item 1 is already decided; item 2 got a fresh PROCESSING status.
        assert_eq!(yielded, vec![IssueId(2)]);
    }

    #[test]
    fn with_status_does_not_replace_existing() {
        let mut queue = vec![pending(1)];
        queue[0]
            .verified
            .insert("check", Box::new(SimpleStatus::failed("broken")));
        let _ = with_status(
            "check",
            &mut queue,
            || Box::new(SimpleStatus::processing()),
            false,
        )
        .count();
        assert_eq!(
            queue[0].verified.get("check").unwrap().state(),
            VerifierState::Failed
        );
    }
}
