//! Checkout backed by a local git working copy.
//!
//! Shells out to the `git` binary with a clean environment (no system or
//! user config) so behavior is reproducible across machines. `prepare`
//! fetches and detaches onto the requested revision, `commit` lands on the
//! configured branch via `push HEAD:<branch>`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use async_trait::async_trait;

use crate::review::{PatchKind, PatchSet};
use crate::types::Revision;

use super::{Checkout, CheckoutError};

pub struct GitCheckout {
    path: PathBuf,
    name: String,
    branch: String,
}

impl GitCheckout {
    pub fn new(path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkout".to_string());
        GitCheckout {
            path,
            name,
            branch: branch.into(),
        }
    }

    /// Builds a git command with system and user config disabled.
    fn git_command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.path);
        cmd.env("GIT_CONFIG_NOSYSTEM", "1");
        cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<Output, CheckoutError> {
        let output = self.git_command().args(args).output()?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(CheckoutError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn run_stdout(&self, args: &[&str]) -> Result<String, CheckoutError> {
        let output = self.run(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn head(&self) -> Result<Revision, CheckoutError> {
        Ok(Revision::new(self.run_stdout(&["rev-parse", "HEAD"])?))
    }
}

/// Splits `"Full Name <mail>"` or a bare address into (name, email).
fn author_identity(author: &str) -> (String, String) {
    if let Some((name, rest)) = author.split_once('<') {
        let name = name.trim();
        let email = rest.trim_end_matches('>').trim();
        if !name.is_empty() && !email.is_empty() {
            return (name.to_string(), email.to_string());
        }
    }
    let name = author.split('@').next().unwrap_or(author).to_string();
    (name, author.to_string())
}

#[async_trait]
impl Checkout for GitCheckout {
    fn project_path(&self) -> &Path {
        &self.path
    }

    fn project_name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, revision: Option<&Revision>) -> Result<Revision, CheckoutError> {
        self.run(&["fetch", "origin", "--prune"])?;
        self.run(&["reset", "--hard"])?;
        self.run(&["clean", "-qfd"])?;
        let target = match revision {
            Some(rev) => rev.as_str().to_string(),
            None => format!("origin/{}", self.branch),
        };
        self.run(&["checkout", "--detach", &target])?;
        self.head()
    }

    async fn apply_patch(&self, patchset: &PatchSet) -> Result<(), CheckoutError> {
        let mut diff = String::new();
        for patch in &patchset.patches {
            match patch.kind {
                PatchKind::Diff => diff.push_str(&patch.diff),
                PatchKind::Delete => match std::fs::remove_file(self.path.join(&patch.filename)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
                PatchKind::Binary => {
                    return Err(CheckoutError::PatchApplication {
                        output: format!(
                            "binary file {} is not supported by the git checkout",
                            patch.filename
                        ),
                    });
                }
            }
        }
        if diff.is_empty() {
            return Ok(());
        }

        // Git-produced diffs strip one path component; svn-style diffs none.
        let strip = if diff.contains("diff --git") { "-p1" } else { "-p0" };
        let mut child = self
            .git_command()
            .args(["apply", "--index", "--whitespace=nowarn", strip])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Take and drop stdin so git sees EOF before we wait.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(diff.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CheckoutError::PatchApplication {
                output: format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            })
        }
    }

    async fn commit(&self, message: &str, author: &str) -> Result<Revision, CheckoutError> {
        let (name, email) = author_identity(author);
        self.run(&["add", "-A"])?;
        self.run(&[
            "-c",
            &format!("user.name={}", name),
            "-c",
            &format!("user.email={}", email),
            "commit",
            "-m",
            message,
            "--author",
            &format!("{} <{}>", name, email),
        ])?;
        let revision = self.head()?;
        self.run(&["push", "origin", &format!("HEAD:{}", self.branch)])?;
        Ok(revision)
    }

    fn get_settings(&self, key: &str) -> Option<String> {
        let content = std::fs::read_to_string(self.path.join("codereview.settings")).ok()?;
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once(':') {
                if k.trim() == key {
                    let v = v.trim();
                    if v.is_empty() {
                        return None;
                    }
                    return Some(v.to_string());
                }
            }
        }
        None
    }
}
