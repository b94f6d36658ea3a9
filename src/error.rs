//! Error taxonomy for the build engine.
//!
//! Stage code returns `anyhow::Result` for ergonomic `?`-propagation with
//! context, the way the rest of this crate does. `BuildError` is the typed
//! core of that chain: the worker downcasts a failed stage's `anyhow::Error`
//! looking for a `BuildError` to decide how to record the failure (e.g.
//! `ArchiveTraversal` and `ExecutorUnavailable` are never suppressed), and
//! falls back to `Internal` when the failure didn't originate as one of
//! these variants (an I/O error, a panic converted by `catch_unwind`, etc).

use crate::model::job::StageName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid distribution config: {0}")]
    ConfigInvalid(String),

    #[error("unsupported architecture pair: {host} -> {target}")]
    UnsupportedArch { host: String, target: String },

    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("archive traversal attempt: {0}")]
    ArchiveTraversal(String),

    #[error("make failed: {0}")]
    MakeError(String),

    #[error("partitioning failed: {0}")]
    PartitioningError(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// The stage this error should be attributed to, if already pinned at
    /// construction time. Most call sites instead attach the stage via
    /// [`BuildError::at_stage`] at the point where the current stage is
    /// known, since the error itself is usually raised deep in a helper
    /// that has no notion of which stage is calling it.
    pub fn at_stage(self, stage: StageName) -> StagedBuildError {
        StagedBuildError { error: self, stage }
    }
}

/// A `BuildError` attributed to the stage that was running when it occurred.
/// This is what the worker actually records on the `BuildStage` and
/// `BuildJob` rows (spec §4.3 step 4/§7).
#[derive(Debug, Error)]
#[error("{error} (stage: {stage:?})")]
pub struct StagedBuildError {
    pub error: BuildError,
    pub stage: StageName,
}

/// Best-effort extraction of a `BuildError` from an arbitrary `anyhow::Error`
/// chain, for callers (the worker) that need to branch on error kind without
/// forcing every stage function to return `BuildError` directly.
pub fn downcast(err: &anyhow::Error) -> Option<&BuildError> {
    err.downcast_ref::<BuildError>()
        .or_else(|| err.chain().find_map(|c| c.downcast_ref::<BuildError>()))
}
