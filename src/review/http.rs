//! HTTP client for a Rietveld-style review service.
//!
//! Endpoints used:
//! - `GET  /search?format=json&commit=2&closed=3`: issues with the commit
//!   flag set on their latest patchset
//! - `GET  /api/<issue>?messages=true`: issue properties
//! - `GET  /download/issue<issue>_<patchset>.diff`: raw patch
//! - `POST /<issue>/close`, `/<issue>/description`, `/<issue>/publish`,
//!   `/<issue>/edit_flags`: mutations

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::types::{IssueId, PatchsetId};

use super::{CodeReview, IssueProps, PatchSet, ReviewError};

/// reqwest-backed [`CodeReview`] implementation.
pub struct HttpReview {
    base_url: String,
    user: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    results: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    issue: IssueId,
}

impl HttpReview {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>) -> Self {
        HttpReview {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ReviewError> {
        let url = self.endpoint(path);
        debug!(%url, "review GET");
        let response = self.client.get(&url).send().await?;
        check_status(response, path)
    }

    async fn post(&self, path: &str, form: &[(&str, &str)]) -> Result<(), ReviewError> {
        let url = self.endpoint(path);
        debug!(%url, "review POST");
        let response = self.client.post(&url).form(form).send().await?;
        check_status(response, path)?;
        Ok(())
    }
}

fn check_status(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, ReviewError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ReviewError::Status {
            status: status.as_u16(),
            context: context.to_string(),
        })
    }
}

#[async_trait]
impl CodeReview for HttpReview {
    fn url(&self) -> &str {
        &self.base_url
    }

    fn email(&self) -> &str {
        &self.user
    }

    async fn get_pending_issues(&self) -> Result<Vec<IssueId>, ReviewError> {
        let results: SearchResults = self
            .get("search?format=json&commit=2&closed=3&limit=1000")
            .await?
            .json()
            .await?;
        Ok(results.results.into_iter().map(|e| e.issue).collect())
    }

    async fn get_issue_properties(&self, issue: IssueId) -> Result<IssueProps, ReviewError> {
        let props = self
            .get(&format!("api/{}?messages=true", issue))
            .await?
            .json()
            .await?;
        Ok(props)
    }

    async fn get_patch(
        &self,
        issue: IssueId,
        patchset: PatchsetId,
    ) -> Result<PatchSet, ReviewError> {
        let text = self
            .get(&format!("download/issue{}_{}.diff", issue, patchset))
            .await?
            .text()
            .await?;
        Ok(PatchSet::from_unified_diff(&text))
    }

    async fn close_issue(&self, issue: IssueId) -> Result<(), ReviewError> {
        self.post(&format!("{}/close", issue), &[]).await
    }

    async fn update_description(
        &self,
        issue: IssueId,
        description: &str,
    ) -> Result<(), ReviewError> {
        self.post(
            &format!("{}/description", issue),
            &[("description", description)],
        )
        .await
    }

    async fn add_comment(&self, issue: IssueId, message: &str) -> Result<(), ReviewError> {
        self.post(
            &format!("{}/publish", issue),
            &[("message", message), ("send_mail", "1")],
        )
        .await
    }

    async fn set_flag(
        &self,
        issue: IssueId,
        patchset: PatchsetId,
        flag: &str,
        value: &str,
    ) -> Result<bool, ReviewError> {
        let patchset = patchset.to_string();
        self.post(
            &format!("{}/edit_flags", issue),
            &[("last_patchset", patchset.as_str()), (flag, value)],
        )
        .await?;
        Ok(true)
    }
}
