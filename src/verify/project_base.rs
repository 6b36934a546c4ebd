//! Pre-patch verifier: the issue must target one of this queue's project
//! base URLs.
//!
//! Several projects can share one review instance, so a non-matching base
//! URL is not an error; the issue simply belongs to some other queue. The
//! result is IGNORED: a silent, permanent veto with no comment posted.

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::types::PendingCommit;

use super::status::SimpleStatus;
use super::{Verifier, VerifyError};

pub const NAME: &str = "project_base";

pub struct ProjectBaseVerifier {
    project_bases: Vec<Regex>,
}

impl ProjectBaseVerifier {
    /// `project_bases` match the full base URL. A pattern may capture a
    /// trailing group naming the path below the checkout root the patch
    /// applies to (e.g. `^svn://server/trunk/src(|/.*)$`).
    pub fn new(project_bases: Vec<Regex>) -> Self {
        ProjectBaseVerifier { project_bases }
    }
}

#[async_trait]
impl Verifier for ProjectBaseVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        let matches: Vec<regex::Captures<'_>> = self
            .project_bases
            .iter()
            .filter_map(|r| r.captures(&pending.base_url))
            .collect();

        let status = match matches.first() {
            None => {
                info!(base_url = %pending.base_url, "base url not in the project bases");
                SimpleStatus::ignored()
            }
            Some(captures) => {
                if matches.len() > 1 {
                    warn!(
                        base_url = %pending.base_url,
                        "base url matched multiple project bases"
                    );
                }
                // The last participating group, if any, is the relative path.
                if let Some(group) = (1..captures.len()).rev().find_map(|i| captures.get(i)) {
                    pending.relpath = group.as_str().trim_start_matches('/').to_string();
                }
                SimpleStatus::succeeded()
            }
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

    fn pending(base_url: &str) -> PendingCommit {
        PendingCommit::new(
            IssueId(1),
            "a@example.com",
            vec![],
            PatchsetId(1),
            base_url,
            "d",
            vec![],
        )
    }

    fn verifier(patterns: &[&str]) -> ProjectBaseVerifier {
        ProjectBaseVerifier::new(patterns.iter().map(|p| Regex::new(p).unwrap()).collect())
    }

    #[tokio::test]
    async fn non_matching_base_is_ignored() {
        let v = verifier(&[r"^svn://good/repo(|/.*)$"]);
        let mut p = pending("svn://elsewhere/repo");
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Ignored);
        assert_eq!(p.error_message(), None);
    }

    #[tokio::test]
    async fn matching_base_succeeds() {
        let v = verifier(&[r"^svn://good/repo(|/.*)$"]);
        let mut p = pending("svn://good/repo");
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Succeeded);
        assert_eq!(p.relpath, "");
    }

    #[tokio::test]
    async fn capture_group_sets_relpath() {
        let v = verifier(&[r"^svn://good/repo(|/.*)$"]);
        let mut p = pending("svn://good/repo/sub/dir");
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Succeeded);
        assert_eq!(p.relpath, "sub/dir");
    }

    #[tokio::test]
    async fn no_patterns_means_everything_ignored() {
        let v = verifier(&[]);
        let mut p = pending("svn://any/repo");
        v.verify(&mut p).await.unwrap();
        assert_eq!(p.state(), VerifierState::Ignored);
    }
}
