//! Post-patch verifier: runs the project's presubmit command inside the
//! checkout.
//!
//! The command runs with the patch already applied and its working directory
//! at the checkout root. A non-zero exit or a timeout fails the patch with
//! the captured output; failing to spawn the command at all is transient
//! (logged and retried next iteration).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::checkout::Checkout;
use crate::types::PendingCommit;

use super::status::SimpleStatus;
use super::{Verifier, VerifyError};

pub const NAME: &str = "presubmit";

/// Default cap on presubmit runtime (6 minutes, like the original scripts).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

pub struct PresubmitVerifier {
    checkout: Arc<dyn Checkout>,
    command: Vec<String>,
    timeout: Duration,
}

impl PresubmitVerifier {
    pub fn new(checkout: Arc<dyn Checkout>, command: Vec<String>) -> Self {
        PresubmitVerifier {
            checkout,
            command,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Verifier for PresubmitVerifier {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn verify(&self, pending: &mut PendingCommit) -> Result<(), VerifyError> {
        let (program, args) = match self.command.split_first() {
            Some(split) => split,
            None => {
                debug!("no presubmit command configured, passing");
                pending
                    .verified
                    .insert(NAME, Box::new(SimpleStatus::succeeded()));
                return Ok(());
            }
        };

        info!(issue = %pending.issue, "running presubmit check");
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(self.checkout.project_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let status = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_elapsed) => SimpleStatus::failed(format!(
                "The presubmit check timed out after {} seconds.",
                self.timeout.as_secs()
            )),
            Ok(output) => {
                let output = output?;
                if output.status.success() {
                    SimpleStatus::succeeded()
                } else {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    SimpleStatus::failed(format!(
                        "Presubmit check failed:\n{}",
                        text.trim_end()
                    ))
                }
            }
        };
        pending.verified.insert(NAME, Box::new(status));
        Ok(())
    }

    async fn update_status(&self, _queue: &mut [PendingCommit]) -> Result<(), VerifyError> {
        Ok(())
    }
}
