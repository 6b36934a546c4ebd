//! Dry-run wrapper around a review service.
//!
//! Delegates every read and silently drops every mutation, so a dry-run
//! queue observes the real world without touching it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::types::{IssueId, PatchsetId};

use super::{CodeReview, IssueProps, PatchSet, ReviewError};

pub struct ReadOnlyReview {
    inner: Arc<dyn CodeReview>,
}

impl ReadOnlyReview {
    pub fn new(inner: Arc<dyn CodeReview>) -> Self {
        ReadOnlyReview { inner }
    }
}

#[async_trait]
impl CodeReview for ReadOnlyReview {
    fn url(&self) -> &str {
        self.inner.url()
    }

    fn email(&self) -> &str {
        self.inner.email()
    }

    async fn get_pending_issues(&self) -> Result<Vec<IssueId>, ReviewError> {
        self.inner.get_pending_issues().await
    }

    async fn get_issue_properties(&self, issue: IssueId) -> Result<IssueProps, ReviewError> {
        self.inner.get_issue_properties(issue).await
    }

    async fn get_patch(
        &self,
        issue: IssueId,
        patchset: PatchsetId,
    ) -> Result<PatchSet, ReviewError> {
        self.inner.get_patch(issue, patchset).await
    }

    async fn close_issue(&self, issue: IssueId) -> Result<(), ReviewError> {
        info!(%issue, "dry run: would close issue");
        Ok(())
    }

    async fn update_description(
        &self,
        issue: IssueId,
        _description: &str,
    ) -> Result<(), ReviewError> {
        info!(%issue, "dry run: would update description");
        Ok(())
    }

    async fn add_comment(&self, issue: IssueId, message: &str) -> Result<(), ReviewError> {
        info!(%issue, %message, "dry run: would add comment");
        Ok(())
    }

    async fn set_flag(
        &self,
        issue: IssueId,
        _patchset: PatchsetId,
        flag: &str,
        value: &str,
    ) -> Result<bool, ReviewError> {
        info!(%issue, %flag, %value, "dry run: would set flag");
        Ok(true)
    }
}
