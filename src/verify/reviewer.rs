//! Pre-patch verifier: someone with commit rights must have approved the
//! patch.
//!
//! Scans the messages already posted on the review for an approval whose
//! sender matches the committer list. Approvals from the queue's own account
//! are disregarded; the queue approving its own landings would defeat the
//! point.

use async_trait::async_trait;
use regex::Regex;

use crate::types::PendingCommit;

use super::status::SimpleStatus;
use super::{Verifier, VerifyError};

pub const NAME: &str = "reviewer_lgtm";

pub const NO_LGTM_MESSAGE: &str = "No approval (LGTM) from a valid reviewer yet.\n\
Only an approval from a full committer is accepted. If a committer has\n\
already reviewed this change, ask them to approve it on the review tool.";

pub struct ReviewerLgtmVerifier {
    committers: Vec<Regex>,
    disregard: Vec<Regex>,
}

impl ReviewerLgtmVerifier {
    /// `committers` match accounts allowed to approve; `disregard` match
    /// accounts whose approvals never count (typically the queue's own).
    pub fn new(committers: Vec<Regex>, disregard: Vec<Regex>) -> Self {
        ReviewerLgtmVerifier {
            committers,
            disregard,
        }
    }

    fn is_valid_approver(&self, sender: &str) -> bool {
        !self.disregard.iter().any(|r| r.is_match(sender))
            && self.committers.iter().any(|r| r.is_match(sender))
    }
}

#[async_trait]
impl Verifier for ReviewerLgtmVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        let approved = pending
            .messages
            .iter()
            .any(|m| m.approval && self.is_valid_approver(&m.sender));
        let status = if approved {
            SimpleStatus::succeeded()
        } else {
            SimpleStatus::failed(NO_LGTM_MESSAGE)
        };
        pending.verified.insert(NAME, Box::new(status));
        Ok(())
    }

    async fn update_status(&self, _queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::ReviewMessage;
    use crate::types::{IssueId, PatchsetId};
    use crate::verify::VerifierState;

    fn pending(messages: Vec<ReviewMessage>) -> PendingCommit {
        PendingCommit::new(
            IssueId(1),
            "author@example.com",
            vec!["rev@example.com".to_string()],
            PatchsetId(1),
            "",
            "d",
            messages,
        )
    }

    fn message(sender: &str, approval: bool) -> ReviewMessage {
        ReviewMessage {
            sender: sender.to_string(),
            approval,
            text: None,
        }
    }

    fn verifier() -> ReviewerLgtmVerifier {
        ReviewerLgtmVerifier::new(
            vec![Regex::new(r"^rev@example\.com$").unwrap()],
            vec![Regex::new(r"^commit-bot@example\.com$").unwrap()],
        )
    }

    #[tokio::test]
    async fn committer_approval_passes() {
        let mut p = pending(vec![message("rev@example.com", true)]);
        verifier().verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Succeeded);
    }

    #[tokio::test]
    async fn no_approval_fails() {
        let mut p = pending(vec![message("rev@example.com", false)]);
        verifier().verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Failed);
        assert_eq!(p.error_message().unwrap(), NO_LGTM_MESSAGE);
    }

    #[tokio::test]
    async fn non_committer_approval_does_not_count() {
        let mut p = pending(vec![message("random@example.com", true)]);
        verifier().verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Failed);
    }

    #[tokio::test]
    async fn disregarded_account_approval_does_not_count() {
        let v = ReviewerLgtmVerifier::new(
            vec![Regex::new(r".*@example\.com$").unwrap()],
            vec![Regex::new(r"^commit-bot@example\.com$").unwrap()],
        );
        let mut p = pending(vec![message("commit-bot@example.com", true)]);
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Failed);
    }
}
