//! Post-patch verifier: remote try jobs.
//!
//! `verify` fires the configured builders on the try server, keyed by the
//! patch's `pending_name()`, and records a PROCESSING status. No blocking
//! wait happens anywhere: later loop iterations poll results through
//! `update_status` until every builder reports, and the aggregate flips to
//! SUCCEEDED or FAILED.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::persist::registry::encode_tagged;
use crate::persist::PersistError;
use crate::types::PendingCommit;

use super::state::VerifierState;
use super::status::VerifierStatus;
use super::{with_status, Verifier, VerifyError};

pub const NAME: &str = "try_job";

/// Errors from the try server. All transient: trigger and poll calls are
/// retried on later iterations.
#[derive(Debug, Error)]
pub enum TryServerError {
    #[error("try server returned HTTP {status} for {context}")]
    Status { status: u16, context: String },

    #[error("failed to reach try server: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed try server response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Where one try job stands on its builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TryJobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TryJobState {
    pub fn is_final(&self) -> bool {
        matches!(self, TryJobState::Succeeded | TryJobState::Failed)
    }
}

/// One try job on one builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJob {
    pub builder: String,
    pub state: TryJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TryJob {
    pub fn pending(builder: impl Into<String>) -> Self {
        TryJob {
            builder: builder.into(),
            state: TryJobState::Pending,
            url: None,
        }
    }
}

/// Status recorded for the try-job verifier: one entry per builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryJobStatus {
    pub jobs: BTreeMap<String, TryJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TryJobStatus {
    pub const TAG: &'static str = "try_job";

    /// Fresh status with every builder pending.
    pub fn for_builders(builders: &[String]) -> Self {
        TryJobStatus {
            jobs: builders
                .iter()
                .map(|b| (b.clone(), TryJob::pending(b)))
                .collect(),
            error_message: None,
        }
    }

    /// Records a polled result and keeps the failure summary in sync.
    pub fn record(&mut self, job: TryJob) {
        self.jobs.insert(job.builder.clone(), job);
        let failures: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.state == TryJobState::Failed)
            .map(|j| match &j.url {
                Some(url) => format!("Try job failed on {}: {}", j.builder, url),
                None => format!("Try job failed on {}.", j.builder),
            })
            .collect();
        self.error_message = if failures.is_empty() {
            None
        } else {
            Some(failures.join("\n"))
        };
    }
}

impl VerifierStatus for TryJobStatus {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn state(&self) -> VerifierState {
        if self.jobs.values().any(|j| j.state == TryJobState::Failed) {
            VerifierState::Failed
        } else if self.jobs.values().any(|j| !j.state.is_final()) {
            VerifierState::Processing
        } else {
            VerifierState::Succeeded
        }
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

/// The try server as seen by the verifier.
#[async_trait]
pub trait TryServer: Send + Sync {
    /// Requests a run of `builders` against the patch, keyed by `job_name`.
    async fn trigger(
        &self,
        job_name: &str,
        pending: &PendingCommit,
        builders: &[String],
    ) -> Result<(), TryServerError>;

    /// Returns the jobs currently known for `job_name`. May return a subset
    /// while builders are still spinning up.
    async fn poll(&self, job_name: &str) -> Result<Vec<TryJob>, TryServerError>;
}

/// reqwest-backed try server client.
pub struct HttpTryServer {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTryServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpTryServer {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TryServer for HttpTryServer {
    async fn trigger(
        &self,
        job_name: &str,
        pending: &PendingCommit,
        builders: &[String],
    ) -> Result<(), TryServerError> {
        let url = format!("{}/send_try_patchset", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("name", job_name.to_string()),
                ("issue", pending.issue.to_string()),
                ("patchset", pending.patchset.to_string()),
                ("builders", builders.join(",")),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TryServerError::Status {
                status: status.as_u16(),
                context: url,
            });
        }
        Ok(())
    }

    async fn poll(&self, job_name: &str) -> Result<Vec<TryJob>, TryServerError> {
        let url = format!("{}/json/jobs/{}", self.base_url, job_name);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TryServerError::Status {
                status: status.as_u16(),
                context: url,
            });
        }
        Ok(response.json().await?)
    }
}

pub struct TryJobVerifier {
    server: Arc<dyn TryServer>,
    builders: Vec<String>,
}

impl TryJobVerifier {
    pub fn new(server: Arc<dyn TryServer>, builders: Vec<String>) -> Self {
        TryJobVerifier { server, builders }
    }
}

#[async_trait]
impl Verifier for TryJobVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        info!(
            issue = %pending.issue,
            builders = self.builders.len(),
            "triggering try jobs"
        );
        self.server
            .trigger(&pending.pending_name(), pending, &self.builders)
            .await?;
        pending.verified.insert(
            NAME,
            Box::new(TryJobStatus::for_builders(&self.builders)),
        );
        Ok(())
    }

    async fn update_status(&self, queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        // Only items whose try jobs are still undecided are polled; decided
        // ones keep their state, which makes this idempotent.
        let builders = self.builders.clone();
        for pending in with_status(
            NAME,
            queue,
            move || Box::new(TryJobStatus::for_builders(&builders)),
            true,
        ) {
            let job_name = pending.pending_name();
            let results = self.server.poll(&job_name).await?;
            debug!(issue = %pending.issue, results = results.len(), "polled try jobs");
            if let Some(boxed) = pending.verified.get_mut(NAME) {
                if let Some(status) = boxed.as_any_mut().downcast_mut::<TryJobStatus>() {
                    for job in results {
                        status.record(job);
                    }
                }
            }
        }
        Ok(())
    }
}
