//! Scenario tests for the pending manager, driven through call-recording
//! collaborator mocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;
use crate::test_utils::{default_issue, MockCheckout, MockReview, RecordingSink};
use crate::types::Revision;
use crate::verify::fake::{DeferredFakeVerifier, FakeVerifier};
use crate::verify::status::SimpleStatus;

struct Fixture {
    review: Arc<MockReview>,
    checkout: Arc<MockCheckout>,
    sink: Arc<RecordingSink>,
    manager: PendingManager,
}

fn fixture(pre: Vec<Box<dyn Verifier>>, post: Vec<Box<dyn Verifier>>) -> Fixture {
    fixture_with_config(pre, post, ManagerConfig::default())
}

fn fixture_with_config(
    pre: Vec<Box<dyn Verifier>>,
    post: Vec<Box<dyn Verifier>>,
    config: ManagerConfig,
) -> Fixture {
    let review = Arc::new(MockReview::new());
    let checkout = Arc::new(MockCheckout::new());
    let sink = Arc::new(RecordingSink::new());
    let context = Context::new(review.clone(), checkout.clone(), sink.clone());
    let manager = PendingManager::new(context, pre, post, config).unwrap();
    Fixture {
        review,
        checkout,
        sink,
        manager,
    }
}

fn try_comment(issue: u64) -> String {
    format!(
        "add_comment({}, {}http://localhost/author@example.com/{}/1\n)",
        issue, TRYING_PATCH, issue
    )
}

const COMMIT_CALL: &str = "commit(foo\n\nReview URL: http://nowhere/31337, author@example.com)";

/// Post-patch verifier that fails a single chosen issue.
struct SelectiveVerifier {
    fail_issue: IssueId,
    message: String,
}

#[async_trait]
impl Verifier for SelectiveVerifier {
    fn name(&self) -> &'static str {
        "selective"
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        let status = if pending.issue == self.fail_issue {
            SimpleStatus::failed(self.message.clone())
        } else {
            SimpleStatus::succeeded()
        };
        pending.verified.insert(self.name(), Box::new(status));
        Ok(())
    }

    async fn update_status(&self, _queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// Verifier that raises a discard from `update_status` for one issue.
struct DiscardingVerifier {
    issue: IssueId,
}

#[async_trait]
impl Verifier for DiscardingVerifier {
    fn name(&self) -> &'static str {
        "discarder"
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        pending
            .verified
            .insert(self.name(), Box::new(SimpleStatus::processing()));
        Ok(())
    }

    async fn update_status(&self, queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        if queue.iter().any(|p| p.issue == self.issue) {
            return Err(DiscardPending::new(self.issue, "kicked out by the discarder").into());
        }
        Ok(())
    }
}

mod construction {
    use super::*;

    #[test]
    fn at_least_one_verifier_required() {
        let review = Arc::new(MockReview::new());
        let checkout = Arc::new(MockCheckout::new());
        let sink = Arc::new(RecordingSink::new());
        let context = Context::new(review, checkout, sink);
        let result = PendingManager::new(context, vec![], vec![], ManagerConfig::default());
        assert!(matches!(result, Err(ManagerError::NoVerifiers)));
    }

    #[test]
    fn duplicate_verifier_names_rejected() {
        let review = Arc::new(MockReview::new());
        let checkout = Arc::new(MockCheckout::new());
        let sink = Arc::new(RecordingSink::new());
        let context = Context::new(review, checkout, sink);
        let result = PendingManager::new(
            context,
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
            ManagerConfig::default(),
        );
        assert!(matches!(result, Err(ManagerError::DuplicateVerifier("fake"))));
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn pre_patch_success_commits() {
        let mut f = fixture(
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
            vec![],
        );
        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        f.checkout.check_calls(&[
            "prepare(None)",
            "apply_patch(chrome/file.cc)",
            COMMIT_CALL,
        ]);
        f.review.check_calls(&[
            &try_comment(31337),
            "close_issue(31337)",
            "update_description(31337, foo)",
            "add_comment(31337, Change committed as 125)",
        ]);
        f.sink.check_names(&["initial", "commit"]);
    }

    #[tokio::test]
    async fn post_patch_success_commits() {
        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
        );
        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        f.checkout.check_calls(&[
            // Verification pass.
            "prepare(None)",
            "apply_patch(chrome/file.cc)",
            // Landing pass, re-applied at head.
            "prepare(None)",
            "apply_patch(chrome/file.cc)",
            COMMIT_CALL,
        ]);
        f.review.check_calls(&[
            &try_comment(31337),
            "close_issue(31337)",
            "update_description(31337, foo)",
            "add_comment(31337, Change committed as 125)",
        ]);
        f.sink.check_names(&["initial", "commit"]);
    }

    #[tokio::test]
    async fn post_patch_failure_rejects_with_message() {
        let mut f = fixture(
            vec![],
            vec![Box::new(
                FakeVerifier::new(VerifierState::Failed)
                    .with_message("presubmit error: foo.py line 3"),
            )],
        );
        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        f.checkout
            .check_calls(&["prepare(None)", "apply_patch(chrome/file.cc)"]);
        f.review.check_calls(&[
            &try_comment(31337),
            "set_flag(31337, 1, commit, False)",
            "add_comment(31337, presubmit error: foo.py line 3)",
        ]);
        f.sink.check_names(&["initial", "abort"]);
    }

    #[tokio::test]
    async fn pre_patch_failure_never_enters_the_queue() {
        let mut f = fixture(
            vec![Box::new(
                FakeVerifier::new(VerifierState::Failed).with_message("not a committer"),
            )],
            vec![Box::new(FakeVerifier::named(
                "after",
                VerifierState::Succeeded,
            ))],
        );
        f.manager.process_once().await;

        // The queue never grew and the checkout was never touched.
        assert!(f.manager.queue.is_empty());
        f.checkout.check_calls(&[]);
        f.review.check_calls(&[
            "set_flag(31337, 1, commit, False)",
            "add_comment(31337, not a committer)",
        ]);
        f.sink.check_names(&["abort"]);
    }

    #[tokio::test]
    async fn pre_patch_ignored_is_silently_vetoed() {
        let mut f = fixture(
            vec![Box::new(FakeVerifier::new(VerifierState::Ignored))],
            vec![],
        );
        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        assert!(f.manager.queue.ignored_issues.contains(&IssueId(31337)));
        f.checkout.check_calls(&[]);
        f.review.check_calls(&[]);
        f.sink.check_names(&[]);

        // A later scan does not pick the issue up again.
        f.manager.process_once().await;
        assert!(f.manager.queue.is_empty());
        f.review.check_calls(&[]);
        f.sink.check_names(&[]);
    }

    #[tokio::test]
    async fn deferred_verifier_decides_through_update_status() {
        let mut f = fixture(
            vec![],
            vec![Box::new(DeferredFakeVerifier::new(VerifierState::Succeeded))],
        );

        f.manager.look_for_new_pending_commits().await;
        assert_eq!(f.manager.queue.len(), 1);
        assert!(f.manager.queue.pending_commits[0].verified.is_empty());

        f.manager.process_new_pending_commits().await;
        assert_eq!(
            f.manager.queue.pending_commits[0].state(),
            VerifierState::Processing
        );

        f.manager.update_status().await;
        assert_eq!(
            f.manager.queue.pending_commits[0].state(),
            VerifierState::Succeeded
        );

        f.manager.scan_results().await;
        assert!(f.manager.queue.is_empty());
        f.sink.check_names(&["initial", "commit"]);
    }

    #[tokio::test]
    async fn update_status_is_idempotent_without_external_change() {
        let mut f = fixture(
            vec![],
            vec![Box::new(DeferredFakeVerifier::new(VerifierState::Succeeded))],
        );
        f.manager.look_for_new_pending_commits().await;
        f.manager.process_new_pending_commits().await;

        f.manager.update_status().await;
        let first = f.manager.queue.pending_commits[0].clone();
        f.manager.update_status().await;
        assert_eq!(f.manager.queue.pending_commits[0], first);
    }
}

mod gating {
    use super::*;

    #[tokio::test]
    async fn postpone_blocks_commit_until_clear() {
        let gate = Arc::new(AtomicBool::new(true));
        let mut f = fixture(
            vec![],
            vec![Box::new(
                FakeVerifier::new(VerifierState::Succeeded).with_postpone(gate.clone()),
            )],
        );

        f.manager.process_once().await;
        // Approved but postponed: still queued, nothing landed.
        assert_eq!(f.manager.queue.len(), 1);
        assert_eq!(
            f.manager.queue.pending_commits[0].state(),
            VerifierState::Succeeded
        );
        f.sink.check_names(&["initial"]);

        gate.store(false, Ordering::SeqCst);
        f.manager.process_once().await;
        assert!(f.manager.queue.is_empty());
        f.sink.check_names(&["commit"]);
    }

    #[tokio::test]
    async fn commit_burst_is_throttled() {
        let review = Arc::new(MockReview::new());
        for issue in [31338u64, 31339] {
            let mut props = default_issue();
            props.issue = IssueId(issue);
            review.insert_issue(props);
        }
        let checkout = Arc::new(MockCheckout::new());
        let sink = Arc::new(RecordingSink::new());
        let context = Context::new(review.clone(), checkout, sink);
        let mut manager = PendingManager::new(
            context,
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
            vec![],
            ManagerConfig {
                max_commit_burst: 2,
                ..ManagerConfig::default()
            },
        )
        .unwrap();

        manager.process_once().await;

        let committed = review
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("close_issue"))
            .count();
        assert_eq!(committed, 2);
        assert_eq!(manager.queue.len(), 1);

        // Still inside the burst window on the next iteration.
        manager.process_once().await;
        assert_eq!(manager.queue.len(), 1);
    }
}

mod discovery {
    use super::*;

    #[tokio::test]
    async fn unchecked_commit_flag_flushes_silently() {
        // A post verifier that never decides keeps the item queued.
        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Processing))],
        );
        f.manager.process_once().await;
        assert_eq!(f.manager.queue.len(), 1);
        f.review.check_calls(&[&try_comment(31337)]);
        f.sink.check_names(&["initial"]);

        f.review.remove_issue(IssueId(31337));
        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        // No comment, no flag write: the author unchecked the box.
        f.review.check_calls(&[]);
        f.sink.check_names(&["abort"]);
    }

    #[tokio::test]
    async fn newer_patchset_resets_verification() {
        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Processing))],
        );
        f.manager.process_once().await;
        assert_eq!(f.manager.queue.pending_commits[0].patchset, PatchsetId(1));
        assert!(f.manager.queue.pending_commits[0].verified.contains("fake"));

        f.review.update_issue(IssueId(31337), |props| {
            props.patchsets.push(PatchsetId(2));
        });
        f.manager.look_for_new_pending_commits().await;

        assert_eq!(f.manager.queue.len(), 1);
        let pending = &f.manager.queue.pending_commits[0];
        assert_eq!(pending.patchset, PatchsetId(2));
        // Fresh entry: verification state was reset.
        assert!(pending.verified.is_empty());
    }

    #[tokio::test]
    async fn issue_without_commit_flag_is_not_admitted() {
        let mut f = fixture(
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
            vec![],
        );
        f.review
            .update_issue(IssueId(31337), |props| props.commit = false);
        f.manager.process_once().await;
        assert!(f.manager.queue.is_empty());
        f.review.check_calls(&[]);
    }
}

mod discards {
    use super::*;

    #[tokio::test]
    async fn update_status_discard_removes_exactly_one_item() {
        let mut other = default_issue();
        other.issue = IssueId(31338);

        let mut f = fixture(vec![], vec![Box::new(DiscardingVerifier { issue: IssueId(31337) })]);
        f.review.insert_issue(other);

        f.manager.look_for_new_pending_commits().await;
        f.manager.process_new_pending_commits().await;
        assert_eq!(f.manager.queue.len(), 2);

        f.manager.update_status().await;

        assert_eq!(f.manager.queue.len(), 1);
        assert_eq!(f.manager.queue.pending_commits[0].issue, IssueId(31338));
        // The survivor's verification state is untouched.
        assert_eq!(
            f.manager.queue.pending_commits[0].state(),
            VerifierState::Processing
        );
    }

    #[tokio::test]
    async fn failed_set_flag_still_posts_the_comment() {
        let mut f = fixture(
            vec![],
            vec![Box::new(
                FakeVerifier::new(VerifierState::Failed).with_message("nope"),
            )],
        );
        f.review.fail_set_flag.store(true, Ordering::SeqCst);
        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        f.review
            .check_calls(&[&try_comment(31337), "add_comment(31337, nope)"]);
        f.sink.check_names(&["initial", "abort"]);
    }
}

mod last_minute {
    use super::*;

    #[tokio::test]
    async fn changed_description_rejects_before_commit() {
        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
        );
        f.manager.look_for_new_pending_commits().await;
        f.manager.process_new_pending_commits().await;

        f.review.update_issue(IssueId(31337), |props| {
            props.description = "rewritten".to_string();
        });
        f.manager.scan_results().await;

        assert!(f.manager.queue.is_empty());
        f.review.check_calls(&[
            &try_comment(31337),
            "set_flag(31337, 1, commit, False)",
            &format!("add_comment(31337, {})", DESCRIPTION_UPDATED),
        ]);
        f.checkout
            .check_calls(&["prepare(None)", "apply_patch(chrome/file.cc)"]);
    }

    #[tokio::test]
    async fn new_patchset_at_the_last_minute_rejects() {
        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
        );
        f.manager.look_for_new_pending_commits().await;
        f.manager.process_new_pending_commits().await;

        f.review.update_issue(IssueId(31337), |props| {
            props.patchsets.push(PatchsetId(2));
        });
        f.manager.scan_results().await;

        assert!(f.manager.queue.is_empty());
        f.review.check_calls(&[
            &try_comment(31337),
            "set_flag(31337, 1, commit, False)",
            "add_comment(31337, The commit queue stopped because a new patchset was uploaded.)",
        ]);
    }

    #[tokio::test]
    async fn closed_issue_is_discarded_silently() {
        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
        );
        f.manager.look_for_new_pending_commits().await;
        f.manager.process_new_pending_commits().await;

        f.review
            .update_issue(IssueId(31337), |props| props.closed = true);
        f.manager.scan_results().await;

        assert!(f.manager.queue.is_empty());
        // Flag cleared, but no comment: there is nothing useful to say.
        f.review
            .check_calls(&[&try_comment(31337), "set_flag(31337, 1, commit, False)"]);
    }
}

mod persistence {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn queue_survives_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let mut f = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Processing))],
        );
        f.manager.process_once().await;
        assert_eq!(f.manager.queue.len(), 1);
        f.manager.save(&path).unwrap();

        let mut restarted = fixture(
            vec![],
            vec![Box::new(FakeVerifier::new(VerifierState::Processing))],
        );
        restarted.manager.load(&path).unwrap();
        assert_eq!(restarted.manager.queue, f.manager.queue);

        let pending = &restarted.manager.queue.pending_commits[0];
        assert_eq!(pending.revision, Some(Revision::new("124")));
        assert_eq!(pending.state(), VerifierState::Processing);
    }

    #[tokio::test]
    async fn loading_without_snapshot_keeps_empty_queue() {
        let dir = tempdir().unwrap();
        let mut f = fixture(
            vec![Box::new(FakeVerifier::new(VerifierState::Succeeded))],
            vec![],
        );
        f.manager.load(&dir.path().join("missing.json")).unwrap();
        assert!(f.manager.queue.is_empty());
    }
}

mod scenarios {
    use super::*;

    /// Item A fully approved, item B failed by one verifier. One iteration
    /// commits A and rejects B with a single comment carrying the
    /// verifier's message.
    #[tokio::test]
    async fn one_iteration_commits_a_and_rejects_b() {
        let mut b = default_issue();
        b.issue = IssueId(31338);

        let mut f = fixture(
            vec![],
            vec![
                Box::new(SelectiveVerifier {
                    fail_issue: IssueId(31338),
                    message: "presubmit error: foo.py line 3".to_string(),
                }),
                Box::new(FakeVerifier::named("gate", VerifierState::Succeeded)),
            ],
        );
        f.review.insert_issue(b);

        f.manager.process_once().await;

        assert!(f.manager.queue.is_empty());
        f.review.check_calls(&[
            &try_comment(31337),
            &try_comment(31338),
            "set_flag(31338, 1, commit, False)",
            "add_comment(31338, presubmit error: foo.py line 3)",
            "close_issue(31337)",
            "update_description(31337, foo)",
            "add_comment(31337, Change committed as 125)",
        ]);
        f.sink.check_names(&["initial", "initial", "abort", "commit"]);
    }
}
