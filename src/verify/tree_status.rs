//! Post-patch verifier: gates landing on the tree being open.
//!
//! Whether the tree is open is not a property of the patch, so this verifier
//! always reports SUCCEEDED; the gate lives in `postpone`, which is polled
//! right before a commit. A tree closed within the last five minutes blocks
//! the commit, and so does a failed status fetch: landing blind on a tree
//! that might be closed is worse than waiting one iteration.

use std::any::Any;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::persist::registry::encode_tagged;
use crate::persist::PersistError;
use crate::types::PendingCommit;

use super::state::VerifierState;
use super::status::VerifierStatus;
use super::{Verifier, VerifyError};

pub const NAME: &str = "tree_status";

/// How far back a closure still blocks a commit.
pub const RECENT_WINDOW_SECS: i64 = 5 * 60;

/// Status recorded for the tree-status verifier. Carries the URL it was
/// checked against so persisted snapshots show where the answer came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStatus {
    pub tree_status_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TreeStatus {
    pub const TAG: &'static str = "tree_status";

    pub fn new(tree_status_url: impl Into<String>) -> Self {
        TreeStatus {
            tree_status_url: tree_status_url.into(),
            error_message: None,
        }
    }
}

impl VerifierStatus for TreeStatus {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn state(&self) -> VerifierState {
        // The tree being closed postpones, it never fails the patch.
        VerifierState::Succeeded
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn encode(&self) -> Result<serde_json::Value, PersistError> {
        encode_tagged(Self::TAG, self)
    }

    fn boxed_clone(&self) -> Box<dyn VerifierStatus> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One entry from the status app's `/allstatus` feed.
#[derive(Debug, Clone, Deserialize)]
struct StatusEntry {
    date: String,
    general_state: String,
}

/// Decides whether the tree counts as closed from the feed entries.
///
/// Entries are walked newest first: a non-open entry seen before reaching
/// the cutoff means the tree is (or was too recently) closed.
fn is_closed(mut entries: Vec<(NaiveDateTime, String)>, cutoff: NaiveDateTime) -> bool {
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    for (date, state) in entries {
        if state != "open" {
            warn!(%date, %state, "tree is not open");
            return true;
        }
        if date < cutoff {
            break;
        }
    }
    false
}

fn parse_entry_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.split('.').next().unwrap_or(raw);
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()
}

pub struct TreeStatusVerifier {
    tree_status_url: String,
    client: reqwest::Client,
}

impl TreeStatusVerifier {
    pub fn new(tree_status_url: impl Into<String>) -> Self {
        TreeStatusVerifier {
            tree_status_url: tree_status_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn tree_is_closed(&self) -> bool {
        let cutoff = (Utc::now() - chrono::Duration::seconds(RECENT_WINDOW_SECS)).naive_utc();
        let url = format!(
            "{}/allstatus?format=json&endTime={}",
            self.tree_status_url,
            cutoff.and_utc().timestamp()
        );
        debug!(%url, "fetching tree status");
        let entries: Vec<StatusEntry> = match self.fetch(&url).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(%url, %err, "failed to fetch tree status");
                return true;
            }
        };
        let parsed = entries
            .into_iter()
            .filter_map(|e| parse_entry_date(&e.date).map(|d| (d, e.general_state)))
            .collect();
        is_closed(parsed, cutoff)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<StatusEntry>, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl Verifier for TreeStatusVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        pending
            .verified
            .insert(NAME, Box::new(TreeStatus::new(self.tree_status_url.clone())));
        Ok(())
    }

    async fn update_status(&self, _queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        Ok(())
    }

    async fn postpone(&self, _pending: &PendingCommit) -> bool {
        self.tree_is_closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        parse_entry_date(s).unwrap()
    }

    #[test]
    fn status_always_reports_succeeded() {
        let status = TreeStatus::new("http://status.example.com");
        assert_eq!(status.state(), VerifierState::Succeeded);
    }

    #[test]
    fn status_encodes_with_tag_and_url() {
        let status = TreeStatus::new("http://status.example.com");
        let value = status.encode().unwrap();
        assert_eq!(value["tree_status_url"], "http://status.example.com");
    }

    #[test]
    fn parses_dates_with_fractional_seconds() {
        assert!(parse_entry_date("2012-03-01 10:00:00.123456").is_some());
        assert!(parse_entry_date("2012-03-01 10:00:00").is_some());
        assert!(parse_entry_date("yesterday-ish").is_none());
    }

    #[test]
    fn open_tree_is_not_closed() {
        let cutoff = at("2012-03-01 10:00:00");
        let entries = vec![
            (at("2012-03-01 10:03:00"), "open".to_string()),
            (at("2012-03-01 09:00:00"), "closed".to_string()),
        ];
        // The closure is older than the cutoff; the newest entry is open.
        assert!(!is_closed(entries, cutoff));
    }

    #[test]
    fn currently_closed_tree_blocks() {
        let cutoff = at("2012-03-01 10:00:00");
        let entries = vec![(at("2012-03-01 10:04:00"), "closed".to_string())];
        assert!(is_closed(entries, cutoff));
    }

    #[test]
    fn closure_within_window_blocks() {
        let cutoff = at("2012-03-01 10:00:00");
        let entries = vec![
            (at("2012-03-01 10:04:00"), "open".to_string()),
            (at("2012-03-01 10:01:00"), "throttled".to_string()),
        ];
        assert!(is_closed(entries, cutoff));
    }

    #[test]
    fn no_entries_means_open() {
        let cutoff = at("2012-03-01 10:00:00");
        assert!(!is_closed(vec![], cutoff));
    }
}
