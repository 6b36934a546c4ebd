//! Checkout interface: the working copy patches are applied to and committed
//! from.
//!
//! The checkout is a shared mutable resource; the pending manager serializes
//! every access through its single control loop, so implementations do not
//! need their own locking.

pub mod git;

pub use git::GitCheckout;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::review::PatchSet;
use crate::types::Revision;

/// Errors from checkout operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The patch did not apply. This is terminal for the patch, not for the
    /// process: the pending manager converts it into a discard.
    #[error("failed to apply patch:\n{output}")]
    PatchApplication { output: String },

    /// A checkout command failed for some other reason (usually transient:
    /// the upstream repository being unreachable).
    #[error("checkout command failed: {command}\n{stderr}")]
    CommandFailed { command: String, stderr: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The working copy as seen by the pending manager.
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Root directory of the working copy.
    fn project_path(&self) -> &Path;

    /// Short project name, used for the snapshot filename.
    fn project_name(&self) -> &str;

    /// Syncs the working copy to `revision` (or to head when `None`) and
    /// returns the revision actually checked out.
    async fn prepare(&self, revision: Option<&Revision>) -> Result<Revision, CheckoutError>;

    /// Applies a patchset on top of the prepared revision.
    async fn apply_patch(&self, patchset: &PatchSet) -> Result<(), CheckoutError>;

    /// Commits the applied patch and returns the new revision.
    async fn commit(&self, message: &str, author: &str) -> Result<Revision, CheckoutError>;

    /// Reads a project setting (e.g. `VIEW_VC`) from the checkout's
    /// `codereview.settings` file, if present.
    fn get_settings(&self, key: &str) -> Option<String>;
}

/// A checkout that does nothing, for fast dry runs (`--fake`).
pub struct FakeCheckout {
    path: PathBuf,
    name: String,
}

impl FakeCheckout {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkout".to_string());
        FakeCheckout { path, name }
    }
}

#[async_trait]
impl Checkout for FakeCheckout {
    fn project_path(&self) -> &Path {
        &self.path
    }

    fn project_name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _revision: Option<&Revision>) -> Result<Revision, CheckoutError> {
        info!("fake checkout is syncing");
        Ok(Revision::new("FAKE"))
    }

    async fn apply_patch(&self, _patchset: &PatchSet) -> Result<(), CheckoutError> {
        info!("fake checkout is applying a patch");
        Ok(())
    }

    async fn commit(&self, _message: &str, _author: &str) -> Result<Revision, CheckoutError> {
        info!("fake checkout is committing");
        Ok(Revision::new("FAKED"))
    }

    fn get_settings(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Wraps a real checkout for dry runs: syncs and applies patches so
/// verification is meaningful, but never commits.
pub struct ReadOnlyCheckout {
    inner: std::sync::Arc<dyn Checkout>,
}

impl ReadOnlyCheckout {
    pub fn new(inner: std::sync::Arc<dyn Checkout>) -> Self {
        ReadOnlyCheckout { inner }
    }
}

#[async_trait]
impl Checkout for ReadOnlyCheckout {
    fn project_path(&self) -> &Path {
        self.inner.project_path()
    }

    fn project_name(&self) -> &str {
        self.inner.project_name()
    }

    async fn prepare(&self, revision: Option<&Revision>) -> Result<Revision, CheckoutError> {
        self.inner.prepare(revision).await
    }

    async fn apply_patch(&self, patchset: &PatchSet) -> Result<(), CheckoutError> {
        self.inner.apply_patch(patchset).await
    }

    async fn commit(&self, message: &str, _author: &str) -> Result<Revision, CheckoutError> {
        info!(
            first_line = message.lines().next().unwrap_or(""),
            "dry run: would commit"
        );
        Ok(Revision::new("dry-run"))
    }

    fn get_settings(&self, key: &str) -> Option<String> {
        self.inner.get_settings(key)
    }
}
