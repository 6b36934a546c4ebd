//! Queue persistence.
//!
//! The pending queue is snapshotted to a single versioned JSON file after
//! every control-loop iteration and on shutdown, and restored at startup, so
//! in-flight verification state survives process restarts. Status objects
//! are polymorphic; they serialize with a type tag and are rebuilt through
//! the [`registry::StatusRegistry`].

pub mod atomic;
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::review::ReviewMessage;
use crate::types::{IssueId, PatchsetId, PendingCommit, PendingQueue, Revision};
use crate::verify::state::Verified;

use registry::StatusRegistry;

/// Current snapshot schema version. Bump on breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors from saving or restoring a queue snapshot.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    #[error("serialized status is missing its type tag")]
    MissingTypeTag,

    #[error("serialized status has unregistered type tag {tag:?}")]
    UnknownType { tag: String },

    #[error("status type {tag:?} did not serialize to an object")]
    NotAnObject { tag: &'static str },
}

/// Serialized form of one pending commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPending {
    pub issue: IssueId,
    pub owner: String,
    pub reviewers: Vec<String>,
    pub patchset: PatchsetId,
    pub base_url: String,
    pub description: String,
    pub messages: Vec<ReviewMessage>,
    #[serde(default)]
    pub relpath: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub revision: Option<Revision>,
    /// Verifier name → tagged status object.
    #[serde(default)]
    pub verifications: BTreeMap<String, serde_json::Value>,
}

impl PersistedPending {
    pub fn from_pending(pending: &PendingCommit) -> Result<Self, PersistError> {
        let verifications = pending
            .verified
            .iter()
            .map(|(name, status)| Ok((name.to_string(), status.encode()?)))
            .collect::<Result<BTreeMap<_, _>, PersistError>>()?;
        Ok(PersistedPending {
            issue: pending.issue,
            owner: pending.owner.clone(),
            reviewers: pending.reviewers.clone(),
            patchset: pending.patchset,
            base_url: pending.base_url.clone(),
            description: pending.description.clone(),
            messages: pending.messages.clone(),
            relpath: pending.relpath.clone(),
            files: pending.files.clone(),
            revision: pending.revision.clone(),
            verifications,
        })
    }

    pub fn into_pending(self, registry: &StatusRegistry) -> Result<PendingCommit, PersistError> {
        let mut verified = Verified::new();
        for (name, value) in self.verifications {
            verified.insert(name, registry.decode(&value)?);
        }
        Ok(PendingCommit {
            issue: self.issue,
            owner: self.owner,
            reviewers: self.reviewers,
            patchset: self.patchset,
            base_url: self.base_url,
            description: self.description,
            messages: self.messages,
            relpath: self.relpath,
            files: self.files,
            revision: self.revision,
            verified,
        })
    }
}

/// The on-disk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub last_scan_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ignored_issues: BTreeSet<IssueId>,
    #[serde(default)]
    pub pending_commits: Vec<PersistedPending>,
}

impl PersistedQueue {
    pub fn from_queue(queue: &PendingQueue) -> Result<Self, PersistError> {
        Ok(PersistedQueue {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            last_scan_at: queue.last_scan_at,
            ignored_issues: queue.ignored_issues.clone(),
            pending_commits: queue
                .pending_commits
                .iter()
                .map(PersistedPending::from_pending)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn into_queue(self, registry: &StatusRegistry) -> Result<PendingQueue, PersistError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(PersistError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                got: self.schema_version,
            });
        }
        Ok(PendingQueue {
            pending_commits: self
                .pending_commits
                .into_iter()
                .map(|p| p.into_pending(registry))
                .collect::<Result<_, _>>()?,
            ignored_issues: self.ignored_issues,
            last_scan_at: self.last_scan_at,
        })
    }
}

/// Saves a queue snapshot atomically.
pub fn save_queue(path: &Path, queue: &PendingQueue) -> Result<(), PersistError> {
    let persisted = PersistedQueue::from_queue(queue)?;
    let mut bytes = serde_json::to_vec_pretty(&persisted)?;
    bytes.push(b'\n');
    atomic::write_file_atomic(path, &bytes)?;
    Ok(())
}

/// Loads a queue snapshot.
pub fn load_queue(path: &Path, registry: &StatusRegistry) -> Result<PendingQueue, PersistError> {
    let bytes = std::fs::read(path)?;
    let persisted: PersistedQueue = serde_json::from_slice(&bytes)?;
    persisted.into_queue(registry)
}

/// Loads a queue snapshot, returning `None` when no snapshot exists yet.
/// Malformed snapshots and schema mismatches are still errors.
pub fn try_load_queue(
    path: &Path,
    registry: &StatusRegistry,
) -> Result<Option<PendingQueue>, PersistError> {
    match load_queue(path, registry) {
        Ok(queue) => Ok(Some(queue)),
        Err(PersistError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
