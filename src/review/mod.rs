//! Code-review service interface.
//!
//! The pending manager consumes the review service through the [`CodeReview`]
//! trait; the concrete service is wired in by the binary. [`HttpReview`] talks
//! to a real review instance, [`ReadOnlyReview`] wraps any implementation and
//! swallows mutations for dry runs.

pub mod http;
pub mod readonly;

pub use http::HttpReview;
pub use readonly::ReadOnlyReview;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{IssueId, PatchsetId};

/// Errors from the code-review service.
///
/// All of these are treated as transient by the pending manager: the call is
/// logged and retried on a later loop iteration, except where a verifier
/// explicitly converts one into a discard.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// The service answered with a non-success HTTP status.
    #[error("review service returned HTTP {status} for {context}")]
    Status { status: u16, context: String },

    /// The service could not be reached.
    #[error("failed to reach review service: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with something we could not decode.
    #[error("malformed review service response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A message posted on an issue.
///
/// Only the sender and the approval bit matter to the queue; free-text bodies
/// are dropped when a change is admitted to keep snapshots small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMessage {
    pub sender: String,
    #[serde(default)]
    pub approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ReviewMessage {
    /// Returns a copy without the free-text body.
    pub fn without_text(&self) -> Self {
        ReviewMessage {
            sender: self.sender.clone(),
            approval: self.approval,
            text: None,
        }
    }
}

/// Properties of an issue as reported by the review service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueProps {
    pub issue: IssueId,
    pub description: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    pub owner_email: String,
    /// Patchset ids in upload order; the last one is the active patch.
    #[serde(default)]
    pub patchsets: Vec<PatchsetId>,
    #[serde(default)]
    pub messages: Vec<ReviewMessage>,
    /// Whether the commit flag is set on the issue.
    #[serde(default)]
    pub commit: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub closed: bool,
}

impl IssueProps {
    /// The active (latest) patchset, if the issue has any.
    pub fn latest_patchset(&self) -> Option<PatchsetId> {
        self.patchsets.last().copied()
    }
}

/// How a single file is affected by a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Diff,
    Delete,
    Binary,
}

/// One file's worth of patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub filename: String,
    pub kind: PatchKind,
    pub diff: String,
}

impl FilePatch {
    pub fn diff(filename: impl Into<String>, diff: impl Into<String>) -> Self {
        FilePatch {
            filename: filename.into(),
            kind: PatchKind::Diff,
            diff: diff.into(),
        }
    }

    pub fn delete(filename: impl Into<String>) -> Self {
        FilePatch {
            filename: filename.into(),
            kind: PatchKind::Delete,
            diff: String::new(),
        }
    }
}

/// A whole patchset: the unit fetched from the review service and applied to
/// the checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    pub patches: Vec<FilePatch>,
}

impl PatchSet {
    pub fn new(patches: Vec<FilePatch>) -> Self {
        PatchSet { patches }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn filenames(&self) -> Vec<String> {
        self.patches.iter().map(|p| p.filename.clone()).collect()
    }

    /// Re-roots every file under `relpath`, for patches against a
    /// subdirectory of the checkout.
    pub fn set_relpath(&mut self, relpath: &str) {
        if relpath.is_empty() {
            return;
        }
        for patch in &mut self.patches {
            patch.filename = format!("{}/{}", relpath.trim_end_matches('/'), patch.filename);
        }
    }

    /// Splits a raw unified diff into per-file patches.
    ///
    /// Recognizes svn-style `Index: <file>` headers and git-style
    /// `diff --git a/<file> b/<file>` headers. Text without any recognized
    /// header becomes a single unnamed patch entry.
    pub fn from_unified_diff(text: &str) -> Self {
        fn header_filename(line: &str) -> Option<String> {
            if let Some(rest) = line.strip_prefix("Index: ") {
                return Some(rest.trim().to_string());
            }
            if let Some(rest) = line.strip_prefix("diff --git a/") {
                return rest.split(" b/").next().map(|s| s.trim().to_string());
            }
            None
        }

        let mut patches = Vec::new();
        let mut current: Option<(String, Vec<&str>)> = None;
        for line in text.lines() {
            if let Some(filename) = header_filename(line) {
                if let Some((name, lines)) = current.take() {
                    patches.push(FilePatch::diff(name, lines.join("\n") + "\n"));
                }
                current = Some((filename, vec![line]));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            } else if !line.trim().is_empty() {
                // Diff content before any header: keep it as an unnamed patch.
                current = Some((String::new(), vec![line]));
            }
        }
        if let Some((name, lines)) = current.take() {
            patches.push(FilePatch::diff(name, lines.join("\n") + "\n"));
        }
        PatchSet { patches }
    }
}

/// The code-review service as seen by the pending manager.
#[async_trait]
pub trait CodeReview: Send + Sync {
    /// Base URL of the service, used in comments and commit messages.
    fn url(&self) -> &str;

    /// The account the queue acts as.
    fn email(&self) -> &str;

    /// Issues whose latest patchset has the commit flag set.
    async fn get_pending_issues(&self) -> Result<Vec<IssueId>, ReviewError>;

    async fn get_issue_properties(&self, issue: IssueId) -> Result<IssueProps, ReviewError>;

    async fn get_patch(
        &self,
        issue: IssueId,
        patchset: PatchsetId,
    ) -> Result<PatchSet, ReviewError>;

    async fn close_issue(&self, issue: IssueId) -> Result<(), ReviewError>;

    async fn update_description(
        &self,
        issue: IssueId,
        description: &str,
    ) -> Result<(), ReviewError>;

    async fn add_comment(&self, issue: IssueId, message: &str) -> Result<(), ReviewError>;

    async fn set_flag(
        &self,
        issue: IssueId,
        patchset: PatchsetId,
        flag: &str,
        value: &str,
    ) -> Result<bool, ReviewError>;
}
