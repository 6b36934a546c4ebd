//! Fire-and-forget verification-event sink.
//!
//! Every interesting transition (verification started, verifier progress,
//! commit, abort) is pushed to the sink as a small JSON packet. The core
//! never reads anything back: delivery failures are logged and otherwise
//! ignored, and slow sinks must not block the control loop.

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::types::PendingCommit;

/// One verification event for one pending patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Which verification (or lifecycle step: `initial`, `commit`, `abort`)
    /// this event belongs to.
    pub verification: String,
    pub payload: serde_json::Value,
}

impl StatusEvent {
    pub fn new(verification: impl Into<String>, payload: serde_json::Value) -> Self {
        StatusEvent {
            verification: verification.into(),
            payload,
        }
    }
}

/// Receiver of verification events.
pub trait StatusSink: Send + Sync {
    /// Base URL of the status page, if the sink has one; used in review
    /// comments so authors can follow along.
    fn url(&self) -> Option<&str> {
        None
    }

    /// Fire-and-forget send. Must not block.
    fn send(&self, pending: &PendingCommit, event: StatusEvent);

    /// Flush and release resources before process exit.
    fn close(&self) {}
}

/// Sink that drops everything.
pub struct NullSink;

impl StatusSink for NullSink {
    fn send(&self, pending: &PendingCommit, event: StatusEvent) {
        debug!(
            issue = %pending.issue,
            verification = %event.verification,
            "dropping status event"
        );
    }
}

/// Sink that posts packets to a status web app.
pub struct HttpSink {
    base_url: String,
    password: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(base_url: impl Into<String>, password: impl Into<String>) -> Self {
        HttpSink {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            password: password.into(),
            client: reqwest::Client::new(),
        }
    }
}

/// Packages an event with enough patch identity to be useful on its own.
pub fn package_event(pending: &PendingCommit, event: &StatusEvent) -> serde_json::Value {
    json!({
        "verification": event.verification,
        "payload": event.payload,
        "issue": pending.issue,
        "patchset": pending.patchset,
        "owner": pending.owner,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

impl StatusSink for HttpSink {
    fn url(&self) -> Option<&str> {
        Some(&self.base_url)
    }

    fn send(&self, pending: &PendingCommit, event: StatusEvent) {
        let packet = package_event(pending, &event);
        let url = format!("{}/receiver", self.base_url);
        let client = self.client.clone();
        let password = self.password.clone();
        // Fire and forget: the loop never waits on the sink.
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .form(&[("p", packet.to_string()), ("password", password)])
                .send()
                .await;
            if let Err(err) = result {
                debug!(%url, %err, "status push failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueId, PatchsetId, PendingCommit};

    fn pending() -> PendingCommit {
        PendingCommit::new(
            IssueId(42),
            "owner@example.com",
            vec![],
            PatchsetId(23),
            "",
            "bleh",
            vec![],
        )
    }

    #[test]
    fn packets_carry_patch_identity() {
        let event = StatusEvent::new("initial", serde_json::json!({"revision": "125"}));
        let packet = package_event(&pending(), &event);
        assert_eq!(packet["verification"], "initial");
        assert_eq!(packet["issue"], 42);
        assert_eq!(packet["patchset"], 23);
        assert_eq!(packet["owner"], "owner@example.com");
        assert_eq!(packet["payload"]["revision"], "125");
    }

    #[test]
    fn null_sink_has_no_url() {
        assert_eq!(NullSink.url(), None);
    }

    #[test]
    fn http_sink_reports_url() {
        let sink = HttpSink::new("http://status.example.com/cq/", "sekret");
        assert_eq!(sink.url(), Some("http://status.example.com/cq"));
    }
}
