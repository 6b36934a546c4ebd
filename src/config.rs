//! Project configuration.
//!
//! A project file names the review service, the checkout, and the verifier
//! wiring for one queue instance. Everything is validated up front: invalid
//! regexes and missing credential files are fatal before the loop starts,
//! never at verification time.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::checkout::Checkout;
use crate::notify::{HttpSink, NullSink, StatusSink};
use crate::verify::authors::AuthorVerifier;
use crate::verify::presubmit::PresubmitVerifier;
use crate::verify::project_base::ProjectBaseVerifier;
use crate::verify::reviewer::ReviewerLgtmVerifier;
use crate::verify::tree_status::TreeStatusVerifier;
use crate::verify::try_job::{HttpTryServer, TryJobVerifier};
use crate::verify::Verifier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read project config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse project config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid regex {pattern:?} in {field}: {source}")]
    Regex {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("missing credential file {path}")]
    MissingCredential { path: PathBuf },

    #[error("status_push_url is set but status_push_password_file is not")]
    MissingPushPassword,
}

fn default_branch() -> String {
    "main".to_string()
}

/// One queue's project description, loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Base URL of the review service.
    pub review_url: String,

    /// Account the queue acts as on the review service.
    pub user: String,

    /// Local working copy the patches are applied to.
    pub checkout_path: PathBuf,

    /// Branch commits land on.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Regexes the issue base URL must match; a trailing capture group names
    /// the path below the checkout root.
    pub project_bases: Vec<String>,

    /// Regexes matching accounts whose approval counts. Empty disables the
    /// reviewer check.
    #[serde(default)]
    pub committers: Vec<String>,

    /// Regexes matching allowed patch owners. Empty disables the check.
    #[serde(default)]
    pub authors: Vec<String>,

    /// Presubmit command run inside the checkout. Empty disables the check.
    #[serde(default)]
    pub presubmit_command: Vec<String>,

    /// Try server base URL; requires `try_builders`.
    #[serde(default)]
    pub try_server_url: Option<String>,

    #[serde(default)]
    pub try_builders: Vec<String>,

    /// Tree status app base URL.
    #[serde(default)]
    pub tree_status_url: Option<String>,

    /// Status push app base URL; requires `status_push_password_file`.
    #[serde(default)]
    pub status_push_url: Option<String>,

    #[serde(default)]
    pub status_push_password_file: Option<PathBuf>,
}

fn compile(patterns: &[String], field: &'static str) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConfigError::Regex {
                field,
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Builds the verifier sets this project asks for. The split matters:
    /// pre-patch verifiers gate admission and never touch the checkout.
    pub fn build_verifiers(
        &self,
        checkout: Arc<dyn Checkout>,
    ) -> Result<(Vec<Box<dyn Verifier>>, Vec<Box<dyn Verifier>>), ConfigError> {
        let mut pre_patch: Vec<Box<dyn Verifier>> = vec![Box::new(ProjectBaseVerifier::new(
            compile(&self.project_bases, "project_bases")?,
        ))];
        if !self.authors.is_empty() {
            pre_patch.push(Box::new(AuthorVerifier::new(compile(
                &self.authors,
                "authors",
            )?)));
        }
        if !self.committers.is_empty() {
            let own_account = format!("^{}$", regex::escape(&self.user));
            pre_patch.push(Box::new(ReviewerLgtmVerifier::new(
                compile(&self.committers, "committers")?,
                compile(&[own_account], "user")?,
            )));
        }

        let mut post_patch: Vec<Box<dyn Verifier>> = Vec::new();
        if !self.presubmit_command.is_empty() {
            post_patch.push(Box::new(PresubmitVerifier::new(
                checkout,
                self.presubmit_command.clone(),
            )));
        }
        if let Some(try_server_url) = &self.try_server_url {
            if !self.try_builders.is_empty() {
                post_patch.push(Box::new(TryJobVerifier::new(
                    Arc::new(HttpTryServer::new(try_server_url.clone())),
                    self.try_builders.clone(),
                )));
            }
        }
        if let Some(tree_status_url) = &self.tree_status_url {
            post_patch.push(Box::new(TreeStatusVerifier::new(tree_status_url.clone())));
        }
        Ok((pre_patch, post_patch))
    }

    /// Builds the status sink, reading the push credential when needed.
    pub fn build_status_sink(&self) -> Result<Arc<dyn StatusSink>, ConfigError> {
        let Some(url) = &self.status_push_url else {
            return Ok(Arc::new(NullSink));
        };
        let Some(password_file) = &self.status_push_password_file else {
            return Err(ConfigError::MissingPushPassword);
        };
        let password = std::fs::read_to_string(password_file).map_err(|_| {
            ConfigError::MissingCredential {
                path: password_file.clone(),
            }
        })?;
        Ok(Arc::new(HttpSink::new(
            url.clone(),
            password.trim().to_string(),
        )))
    }
}
