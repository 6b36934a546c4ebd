//! A pending commit: one patch under consideration for landing.

use crate::context::Context;
use crate::review::ReviewMessage;
use crate::types::{IssueId, PatchsetId, Revision};
use crate::verify::state::{Verified, VerifierState};
use crate::verify::{DiscardPending, VerifyError};

/// One code-review patch being driven through apply → verify → commit.
///
/// Created at discovery time once the pre-patch verifiers accept the issue;
/// mutated by verifiers through the [`Verified`] aggregate; removed from the
/// queue on commit, discard or terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommit {
    pub issue: IssueId,
    /// Author email; commits are attributed to it.
    pub owner: String,
    pub reviewers: Vec<String>,
    /// The patchset under verification. A newer patchset supersedes this
    /// entry entirely (fresh verification state).
    pub patchset: PatchsetId,
    pub base_url: String,
    pub description: String,
    /// Messages already posted on the review. Only sender and approval
    /// survive admission; bodies are stripped to keep snapshots small.
    pub messages: Vec<ReviewMessage>,
    /// Path inside the checkout the patch applies under, recorded by the
    /// project-base verifier. Empty means the checkout root.
    pub relpath: String,
    /// Filenames touched by the patch, recorded when it is applied.
    pub files: Vec<String>,
    /// Revision the patch was last applied against; set again (to the true
    /// head) at commit time.
    pub revision: Option<Revision>,
    /// Per-verifier outcomes.
    pub verified: Verified,
}

impl PendingCommit {
    pub fn new(
        issue: IssueId,
        owner: impl Into<String>,
        reviewers: Vec<String>,
        patchset: PatchsetId,
        base_url: impl Into<String>,
        description: impl Into<String>,
        messages: Vec<ReviewMessage>,
    ) -> Self {
        PendingCommit {
            issue,
            owner: owner.into(),
            reviewers,
            patchset,
            base_url: base_url.into(),
            description: description.into().replace('\r', ""),
            messages: messages.iter().map(ReviewMessage::without_text).collect(),
            relpath: String::new(),
            files: Vec::new(),
            revision: None,
            verified: Verified::new(),
        }
    }

    /// Stable name for external job tracking (try jobs): survives restarts
    /// and changes when a new patchset supersedes this one.
    pub fn pending_name(&self) -> String {
        format!("{}-{}", self.issue, self.patchset)
    }

    /// Aggregate verdict across all verifications.
    pub fn state(&self) -> VerifierState {
        self.verified.get_state()
    }

    /// Concatenated verifier error messages, if any.
    pub fn error_message(&self) -> Option<String> {
        self.verified.error_message()
    }

    /// Syncs the checkout to this patch's base revision (or head when none
    /// was recorded yet) and remembers what was actually checked out.
    pub async fn prepare_for_patch(&mut self, ctx: &Context) -> Result<(), VerifyError> {
        let revision = ctx.checkout.prepare(self.revision.as_ref()).await?;
        if revision.as_str().is_empty() {
            return Err(DiscardPending::new(
                self.issue,
                "Internal error: failed to sync the checkout. Please try again.",
            )
            .into());
        }
        self.revision = Some(revision);
        Ok(())
    }

    /// Fetches this patchset from the review service and applies it to the
    /// checkout, optionally preparing the checkout first.
    ///
    /// Failures that can never resolve on their own (empty patchset, patch
    /// does not apply) discard the patch.
    pub async fn apply_patch(&mut self, ctx: &Context, prepare: bool) -> Result<(), VerifyError> {
        use crate::checkout::CheckoutError;

        if prepare {
            self.prepare_for_patch(ctx).await?;
        }

        let mut patches = match ctx.review.get_patch(self.issue, self.patchset).await {
            Ok(patches) => patches,
            Err(err) => {
                return Err(DiscardPending::new(
                    self.issue,
                    format!(
                        "Failed to fetch the patch for this patchset. Note that binary\n\
                         files are not supported yet.\n\n{}",
                        err
                    ),
                )
                .into());
            }
        };
        if patches.is_empty() {
            return Err(
                DiscardPending::new(self.issue, "No diff was found for this patchset.").into(),
            );
        }
        if !self.relpath.is_empty() {
            patches.set_relpath(&self.relpath);
        }
        self.files = patches.filenames();
        if self.files.is_empty() {
            return Err(
                DiscardPending::new(self.issue, "No file was found in this patchset.").into(),
            );
        }

        match ctx.checkout.apply_patch(&patches).await {
            Ok(()) => Ok(()),
            Err(err @ CheckoutError::PatchApplication { .. }) => {
                Err(DiscardPending::new(self.issue, err.to_string()).into())
            }
            Err(err) => Err(DiscardPending::new(
                self.issue,
                format!("Failed to apply the patch.\n{}", err),
            )
            .into()),
        }
    }
}
