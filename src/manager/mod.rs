//! The pending-manager orchestration engine.
//!
//! One control loop drives every patch through its lifecycle:
//!
//! 1. **Discovery**: poll the review service for issues with the commit
//!    flag set; gate admission on the pre-patch verifiers (which never touch
//!    the checkout).
//! 2. **Processing**: for queued items still undecided, sync the checkout,
//!    apply the patch and run the post-patch verifiers.
//! 3. **Status update**: advance asynchronous checks (try jobs) for the
//!    whole queue.
//! 4. **Scan**: commit fully-approved items (unless postponed or the
//!    commit-burst window is full), reject failed ones with the aggregated
//!    error message.
//!
//! The loop owns the queue exclusively and persists a snapshot after every
//! iteration and on shutdown. All checkout access is serialized here; no
//! verifier runs concurrently with another.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::persist::registry::StatusRegistry;
use crate::persist::{self, PersistError};
use crate::review::IssueProps;
use crate::types::{IssueId, PatchsetId, PendingCommit, PendingQueue};
use crate::verify::{DiscardPending, Verifier, VerifierState, VerifyError};

/// Rejection comment when a verifier failed without leaving a message.
pub const FAILED_NO_MESSAGE: &str = "\
Commit queue patch verification failed without an error message.\n\
Something went wrong on the infrastructure side; the maintainers have\n\
been notified. You can safely check the commit box again.";

/// Rejection comment for unexpected internal errors while landing.
pub const INTERNAL_ERROR: &str = "\
The commit queue hit an internal error while landing this change.\n\
The maintainers have been notified. You can safely check the commit\n\
box again.";

/// Rejection comment when the description changed while queued.
pub const DESCRIPTION_UPDATED: &str = "\
The commit queue rejected this change because the description was\n\
changed between the time the change entered the queue and the time it\n\
was ready to commit. You can safely check the commit box again.";

/// Prefix of the comment announcing that verification started.
pub const TRYING_PATCH: &str = "The commit queue is trying the patch. Follow the status at\n";

/// Errors detected when assembling a pending manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("at least one verifier must be configured")]
    NoVerifiers,

    #[error("duplicate verifier name {0:?}")]
    DuplicateVerifier(&'static str),
}

/// Loop pacing and commit throttling knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Delay between control-loop iterations.
    pub poll_interval: Duration,

    /// How often the checkout is synced to head, decoupled from the fast
    /// loop: syncing is expensive and a little staleness is fine.
    pub sync_interval: Duration,

    /// Maximum commits inside one burst window.
    pub max_commit_burst: usize,

    /// Length of the burst window.
    pub commit_burst_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            poll_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(5 * 60),
            max_commit_burst: 3,
            commit_burst_delay: Duration::from_secs(240),
        }
    }
}

/// Fetches flagged issues from the review service, drives them through the
/// verifiers and commits the survivors.
pub struct PendingManager {
    context: Context,
    pre_patch_verifiers: Vec<Box<dyn Verifier>>,
    verifiers: Vec<Box<dyn Verifier>>,
    pub queue: PendingQueue,
    registry: StatusRegistry,
    config: ManagerConfig,
    /// Timestamps of recent commits, for burst throttling.
    recent_commits: Vec<Instant>,
}

impl PendingManager {
    /// `pre_patch_verifiers` run at discovery, before the checkout is ever
    /// touched; `verifiers` run with the patch applied.
    pub fn new(
        context: Context,
        pre_patch_verifiers: Vec<Box<dyn Verifier>>,
        verifiers: Vec<Box<dyn Verifier>>,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        if pre_patch_verifiers.is_empty() && verifiers.is_empty() {
            return Err(ManagerError::NoVerifiers);
        }
        let mut names = BTreeSet::new();
        for verifier in pre_patch_verifiers.iter().chain(verifiers.iter()) {
            if !names.insert(verifier.name()) {
                return Err(ManagerError::DuplicateVerifier(verifier.name()));
            }
        }
        Ok(PendingManager {
            context,
            pre_patch_verifiers,
            verifiers,
            queue: PendingQueue::new(),
            registry: StatusRegistry::builtin(),
            config,
            recent_commits: Vec::new(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Restores the queue from a snapshot, if one exists.
    pub fn load(&mut self, path: &Path) -> Result<(), PersistError> {
        if let Some(queue) = persist::try_load_queue(path, &self.registry)? {
            info!(
                pending = queue.len(),
                ignored = queue.ignored_issues.len(),
                "restored queue snapshot"
            );
            self.queue = queue;
        }
        Ok(())
    }

    /// Snapshots the queue.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        persist::save_queue(path, &self.queue)
    }

    /// One full control-loop iteration.
    pub async fn process_once(&mut self) {
        self.look_for_new_pending_commits().await;
        self.process_new_pending_commits().await;
        self.update_status().await;
        self.scan_results().await;
    }

    /// Runs the control loop until cancelled, saving the queue after every
    /// iteration and once more before returning.
    pub async fn run(
        &mut self,
        db_path: &Path,
        cancel: CancellationToken,
    ) -> Result<(), PersistError> {
        info!(
            poll_interval = ?self.config.poll_interval,
            sync_interval = ?self.config.sync_interval,
            "commit queue started"
        );
        // First head sync only after the loop has warmed up.
        let mut next_sync = Instant::now() + self.config.poll_interval * 2;
        loop {
            self.process_once().await;

            if let Err(err) = self.save(db_path) {
                error!(%err, "failed to save queue snapshot");
            }

            if Instant::now() >= next_sync {
                debug!("syncing checkout to head");
                if let Err(err) = self.context.checkout.prepare(None).await {
                    // Usually the upstream server being flaky; never fatal.
                    warn!(%err, "checkout sync failed");
                }
                next_sync = Instant::now() + self.config.sync_interval;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("shutting down, saving queue");
        self.save(db_path)?;
        self.context.status.close();
        Ok(())
    }

    /// Discovery: admits new flagged issues past the pre-patch verifiers,
    /// flushes unflagged ones and resets superseded patchsets.
    pub async fn look_for_new_pending_commits(&mut self) {
        let new_issues = match self.context.review.get_pending_issues().await {
            Ok(issues) => issues,
            Err(err) => {
                warn!(%err, "failed to fetch pending issues, will retry");
                return;
            }
        };
        self.flush_unflagged(&new_issues).await;

        for issue in new_issues {
            if self.queue.ignored_issues.contains(&issue) {
                continue;
            }
            let props = match self.context.review.get_issue_properties(issue).await {
                Ok(props) => props,
                Err(err) => {
                    warn!(%issue, %err, "failed to fetch issue properties, will retry");
                    continue;
                }
            };
            let latest = match props.latest_patchset() {
                Some(patchset) => patchset,
                None => continue,
            };
            if !props.commit {
                continue;
            }

            match self.queue.get(issue).map(|p| p.patchset) {
                Some(current) if current == latest => continue,
                Some(_) => {
                    // A newer patchset supersedes the queued one entirely:
                    // fresh entry, fresh verification state.
                    info!(%issue, %latest, "newer patchset uploaded, restarting verification");
                    if let Some(pos) = self.queue.position_of(issue) {
                        let pending = self.queue.pending_commits.remove(pos);
                        self.context.send_status(
                            &pending,
                            "abort",
                            json!({ "output": "A newer patchset was uploaded; verification restarted." }),
                        );
                    }
                }
                None => {}
            }
            self.admit_candidate(props, latest).await;
        }
        self.queue.last_scan_at = Some(Utc::now());
    }

    /// Removes queued items whose commit flag was unchecked. Silent on the
    /// review: unchecking the flag is the author's own action.
    async fn flush_unflagged(&mut self, new_issues: &[IssueId]) {
        let still_flagged: BTreeSet<IssueId> = new_issues.iter().copied().collect();
        let mut flushed = Vec::new();
        self.queue.pending_commits.retain(|pending| {
            if still_flagged.contains(&pending.issue) {
                true
            } else {
                flushed.push(pending.clone());
                false
            }
        });
        for pending in flushed {
            info!(issue = %pending.issue, "commit flag was unchecked, flushing");
            self.context.send_status(
                &pending,
                "abort",
                json!({ "output": "The commit flag was unchecked. Ignoring." }),
            );
        }
    }

    /// Runs the pre-patch verifiers on a discovered issue and admits it to
    /// the queue when they let it through.
    async fn admit_candidate(&mut self, props: IssueProps, patchset: PatchsetId) {
        let issue = props.issue;
        let mut pending = PendingCommit::new(
            issue,
            props.owner_email,
            props.reviewers,
            patchset,
            props.base_url,
            props.description,
            props.messages,
        );
        info!(%issue, %patchset, "found new pending commit");

        match self.run_missing_verifiers(&mut pending, Phase::PrePatch).await {
            Ok(true) => {
                if self.verifiers.is_empty() {
                    // Nothing left to verify against the checkout; tell the
                    // author verification is underway right now.
                    if let Err(err) = self.announce(&pending).await {
                        warn!(%issue, %err, "failed to announce verification");
                    }
                }
                self.queue.pending_commits.push(pending);
            }
            Ok(false) => {
                // Permanent silent veto; remember the issue so it is not
                // re-fetched on every scan.
                debug!(%issue, "issue vetoed by pre-patch verification");
                self.queue.ignored_issues.insert(issue);
            }
            Err(VerifyError::Discard(discard)) => {
                self.discard_pending(&mut pending, discard.message).await;
            }
            Err(err) => {
                warn!(%issue, %err, "pre-patch verification failed, will retry");
            }
        }
    }

    /// Processing: runs the missing verifiers on queued, still-undecided
    /// items, applying the patch first where post-patch verifiers exist.
    pub async fn process_new_pending_commits(&mut self) {
        let mut idx = 0;
        while idx < self.queue.pending_commits.len() {
            {
                let pending = &self.queue.pending_commits[idx];
                let missing = self
                    .all_verifier_names()
                    .any(|name| !pending.verified.contains(name));
                if !missing || pending.state() != VerifierState::Processing {
                    idx += 1;
                    continue;
                }
                info!(issue = %pending.issue, "verifying pending commit");
            }
            let mut pending = self.queue.pending_commits.remove(idx);
            match self.verify_pending(&mut pending).await {
                Ok(()) => {
                    self.queue.pending_commits.insert(idx, pending);
                    idx += 1;
                }
                Err(VerifyError::Discard(discard)) => {
                    self.discard_pending(&mut pending, discard.message).await;
                }
                Err(err) => {
                    error!(
                        issue = %pending.issue,
                        %err,
                        "verification hit a transient error, will retry"
                    );
                    self.queue.pending_commits.insert(idx, pending);
                    idx += 1;
                }
            }
        }
    }

    /// Runs every verifier the item is still missing.
    async fn verify_pending(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        if !self.run_missing_verifiers(pending, Phase::PrePatch).await? {
            // IGNORED mid-queue: the entry stays, inert, so the issue is not
            // picked up again.
            return Ok(());
        }
        if self.verifiers.is_empty() {
            return Ok(());
        }

        pending.prepare_for_patch(&self.context).await?;

        // The patch is real business now; this is sent after syncing but
        // before applying, so a broken patch still shows up on the status
        // page.
        self.announce(pending).await?;

        pending.apply_patch(&self.context, false).await?;
        self.run_missing_verifiers(pending, Phase::PostPatch).await?;
        Ok(())
    }

    /// Status update: advances asynchronous checks for the whole queue.
    pub async fn update_status(&mut self) {
        let mut discards: Vec<DiscardPending> = Vec::new();
        {
            let queue = &mut self.queue.pending_commits;
            for verifier in self.pre_patch_verifiers.iter().chain(self.verifiers.iter()) {
                if let Err(err) = verifier.update_status(queue).await {
                    match err {
                        VerifyError::Discard(discard) => discards.push(discard),
                        err => warn!(
                            verifier = verifier.name(),
                            %err,
                            "status update failed, will retry"
                        ),
                    }
                }
            }
        }
        for discard in discards {
            if let Some(pos) = self.queue.position_of(discard.issue) {
                let mut pending = self.queue.pending_commits.remove(pos);
                self.discard_pending(&mut pending, discard.message).await;
            }
        }
    }

    /// Scan: commits approved items, rejects failed ones.
    pub async fn scan_results(&mut self) {
        let mut idx = 0;
        while idx < self.queue.pending_commits.len() {
            match self.queue.pending_commits[idx].state() {
                VerifierState::Failed => {
                    let mut pending = self.queue.pending_commits.remove(idx);
                    let message = pending
                        .error_message()
                        .unwrap_or_else(|| FAILED_NO_MESSAGE.to_string());
                    self.discard_pending(&mut pending, Some(message)).await;
                }
                VerifierState::Succeeded => {
                    if self.should_throttle(&self.queue.pending_commits[idx]).await {
                        idx += 1;
                        continue;
                    }
                    // The item is removed right away; a landing failure turns
                    // into a discard, never back into a queued item.
                    let mut pending = self.queue.pending_commits.remove(idx);
                    match self.land_pending(&mut pending).await {
                        Ok(()) => {
                            info!(
                                issue = %pending.issue,
                                revision = ?pending.revision,
                                "committed"
                            );
                        }
                        Err(VerifyError::Discard(discard)) => {
                            self.discard_pending(&mut pending, discard.message).await;
                        }
                        Err(err) => {
                            error!(issue = %pending.issue, %err, "internal error while landing");
                            self.discard_pending(&mut pending, Some(INTERNAL_ERROR.to_string()))
                                .await;
                        }
                    }
                }
                // PROCESSING is still being decided. IGNORED stays queued and
                // inert so the issue is not fetched over and over; clearing
                // the commit flag is not an option, the flag may belong to
                // another queue sharing the review instance.
                VerifierState::Processing | VerifierState::Ignored => {
                    idx += 1;
                }
            }
        }
    }

    fn all_verifier_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pre_patch_verifiers
            .iter()
            .chain(self.verifiers.iter())
            .map(|v| v.name())
    }

    /// Runs each verifier in `phase` the item has no status for yet.
    ///
    /// Returns Ok(false) on an IGNORED short-circuit (other verifications
    /// are cleared so the single veto survives); converts FAILED into a
    /// discard carrying the aggregated error message.
    async fn run_missing_verifiers(
        &self,
        pending: &mut PendingCommit,
        phase: Phase,
    ) -> Result<bool, VerifyError> {
        let verifiers = match phase {
            Phase::PrePatch => &self.pre_patch_verifiers,
            Phase::PostPatch => &self.verifiers,
        };
        for verifier in verifiers {
            if pending.verified.contains(verifier.name()) {
                continue;
            }
            verifier.verify(pending).await?;
            debug_assert!(
                pending.verified.contains(verifier.name()),
                "verifier {} did not record a status",
                verifier.name()
            );
            match pending.state() {
                VerifierState::Ignored => {
                    pending.verified.retain_only(verifier.name());
                    return Ok(false);
                }
                VerifierState::Failed => {
                    // Stop right here so the error message is not diluted by
                    // verifiers that never ran.
                    let message = pending
                        .error_message()
                        .unwrap_or_else(|| FAILED_NO_MESSAGE.to_string());
                    return Err(DiscardPending::new(pending.issue, message).into());
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Tells the author (and the status page) that verification started.
    async fn announce(&self, pending: &PendingCommit) -> Result<(), VerifyError> {
        self.context.send_status(
            pending,
            "initial",
            json!({ "revision": pending.revision.as_ref().map(|r| r.as_str()) }),
        );
        let base = self
            .context
            .status
            .url()
            .unwrap_or_else(|| self.context.review.url());
        let comment = format!(
            "{}{}/{}/{}/{}\n",
            TRYING_PATCH, base, pending.owner, pending.issue, pending.patchset
        );
        self.context.review.add_comment(pending.issue, &comment).await?;
        Ok(())
    }

    /// True when an approved item must wait: a verifier postpones, or the
    /// recent commit burst is already at the cap.
    async fn should_throttle(&self, pending: &PendingCommit) -> bool {
        for verifier in self.pre_patch_verifiers.iter().chain(self.verifiers.iter()) {
            if verifier.postpone(pending).await {
                debug!(
                    issue = %pending.issue,
                    verifier = verifier.name(),
                    "commit postponed"
                );
                return true;
            }
        }
        if self.recent_commits.is_empty() {
            return false;
        }
        let burst = match Instant::now().checked_sub(self.config.commit_burst_delay) {
            Some(cutoff) => self.recent_commits.iter().filter(|t| **t > cutoff).count(),
            None => self.recent_commits.len(),
        };
        burst >= self.config.max_commit_burst
    }

    /// Last-minute checks plus the actual commit and issue close-out.
    async fn land_pending(&mut self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        self.last_minute_checks(pending).await?;

        // Re-apply on the true head, whatever was prepared earlier.
        pending.revision = None;
        pending.apply_patch(&self.context, true).await?;

        // Built exactly once; never re-derived afterwards.
        let commit_message = format!(
            "{}\n\nReview URL: {}/{}",
            pending.description,
            self.context.review.url(),
            pending.issue
        );
        let revision = match self
            .context
            .checkout
            .commit(&commit_message, &pending.owner)
            .await
        {
            Ok(revision) => revision,
            Err(err) => {
                return Err(DiscardPending::new(
                    pending.issue,
                    format!("Failed to commit the patch.\n{}", err),
                )
                .into());
            }
        };
        if revision.as_str().is_empty() {
            return Err(DiscardPending::new(pending.issue, "Failed to commit patch.").into());
        }
        pending.revision = Some(revision.clone());

        self.recent_commits.push(Instant::now());
        let keep = self.config.max_commit_burst + 1;
        if self.recent_commits.len() > keep {
            let drop = self.recent_commits.len() - keep;
            self.recent_commits.drain(..drop);
        }

        self.close_issue(pending, &revision).await?;
        Ok(())
    }

    /// Re-checks the issue on the review service right before committing:
    /// the queue may have been racing the author the whole time.
    async fn last_minute_checks(&self, pending: &PendingCommit) -> Result<(), VerifyError> {
        let props = self.context.review.get_issue_properties(pending.issue).await?;
        if !props.commit {
            return Err(DiscardPending::silent(pending.issue).into());
        }
        if props.closed {
            return Err(DiscardPending::silent(pending.issue).into());
        }
        if pending.description != props.description.replace('\r', "") {
            return Err(DiscardPending::new(pending.issue, DESCRIPTION_UPDATED).into());
        }

        let commit_user = self.context.review.email();
        let expected: BTreeSet<&str> = pending
            .reviewers
            .iter()
            .map(String::as_str)
            .filter(|r| *r != commit_user)
            .collect();
        let actual: BTreeSet<&str> = props
            .reviewers
            .iter()
            .map(String::as_str)
            .filter(|r| *r != commit_user)
            .collect();
        // Be nice: a drive-by reviewer who did approve is not a reason to
        // stop the landing.
        let is_approver = |reviewer: &str| {
            props
                .messages
                .iter()
                .any(|m| m.approval && m.sender == reviewer)
        };
        let drive_by: Vec<&str> = actual
            .difference(&expected)
            .copied()
            .filter(|r| !is_approver(r))
            .collect();
        if !drive_by.is_empty() {
            return Err(DiscardPending::new(
                pending.issue,
                format!(
                    "List of reviewers changed. {} did a drive-by without approving!",
                    drive_by.join(",")
                ),
            )
            .into());
        }

        if props.latest_patchset() != Some(pending.patchset) {
            return Err(DiscardPending::new(
                pending.issue,
                "The commit queue stopped because a new patchset was uploaded.",
            )
            .into());
        }
        Ok(())
    }

    /// Closes out a committed issue on the review service.
    async fn close_issue(
        &self,
        pending: &PendingCommit,
        revision: &crate::types::Revision,
    ) -> Result<(), VerifyError> {
        let viewvc = self.context.checkout.get_settings("VIEW_VC");
        let mut description = pending.description.clone();
        let (message, url) = match viewvc {
            Some(viewvc) => {
                let url = format!("{}{}", viewvc.trim_end_matches('/'), revision);
                (format!("Committed: {}", url), Some(url))
            }
            None => (format!("Committed: {}", revision), None),
        };
        if url.is_some() {
            description.push_str("\n\n");
            description.push_str(&message);
        }
        self.context.send_status(
            pending,
            "commit",
            json!({
                "revision": revision.as_str(),
                "output": message,
                "url": url,
            }),
        );
        let review = &self.context.review;
        review.close_issue(pending.issue).await?;
        review.update_description(pending.issue, &description).await?;
        review
            .add_comment(pending.issue, &format!("Change committed as {}", revision))
            .await?;
        Ok(())
    }

    /// Removes a patch from consideration. With a message, the author is
    /// notified (comment + cleared commit flag + abort event); without one,
    /// only the flag is cleared. IGNORED items touch nothing at all: the
    /// commit flag may belong to another queue sharing the review instance.
    async fn discard_pending(&self, pending: &mut PendingCommit, message: Option<String>) {
        if pending.state() != VerifierState::Ignored {
            if let Err(err) = self
                .context
                .review
                .set_flag(pending.issue, pending.patchset, "commit", "False")
                .await
            {
                error!(
                    issue = %pending.issue,
                    %err,
                    "failed to clear the commit flag"
                );
            }
        }
        if let Some(message) = message {
            if let Err(err) = self.context.review.add_comment(pending.issue, &message).await {
                error!(
                    issue = %pending.issue,
                    %err,
                    "failed to post the rejection comment"
                );
            }
            self.context
                .send_status(pending, "abort", json!({ "output": message }));
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    PrePatch,
    PostPatch,
}
