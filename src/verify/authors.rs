//! Pre-patch verifier: the patch owner must be on the author allow-list.

use async_trait::async_trait;
use regex::Regex;

use crate::types::PendingCommit;

use super::status::SimpleStatus;
use super::{Verifier, VerifyError};

pub const NAME: &str = "authors";

pub struct AuthorVerifier {
    allow_list: Vec<Regex>,
}

impl AuthorVerifier {
    pub fn new(allow_list: Vec<Regex>) -> Self {
        AuthorVerifier { allow_list }
    }
}

#[async_trait]
impl Verifier for AuthorVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        let status = if self.allow_list.iter().any(|r| r.is_match(&pending.owner)) {
            SimpleStatus::succeeded()
        } else {
            SimpleStatus::failed(format!(
                "Can't commit because the owner {} is not in the allow-list.",
                pending.owner
            ))
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
    use crate::types::{IssueId, PatchsetId};
    use crate::verify::VerifierState;

    fn pending(owner: &str) -> PendingCommit {
        PendingCommit::new(
            IssueId(1),
            owner,
            vec![],
            PatchsetId(1),
            "",
            "d",
            vec![],
        )
    }

    #[tokio::test]
    async fn listed_owner_passes() {
        let v = AuthorVerifier::new(vec![Regex::new(r"^georges@example\.com$").unwrap()]);
        let mut p = pending("georges@example.com");
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Succeeded);
    }

    #[tokio::test]
    async fn unlisted_owner_fails_with_message() {
        let v = AuthorVerifier::new(vec![Regex::new(r"^georges@example\.com$").unwrap()]);
        let mut p = pending("mallory@example.com");
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Failed);
        assert!(p
            .error_message()
            .unwrap()
            .contains("mallory@example.com is not in the allow-list"));
    }
}
