//! Trait shapes for the relational store. Modeled as traits (rather than a
//! concrete database client) so the engine compiles and is testable
//! standalone; the production adapters are out of scope (spec §1).

use crate::model::{
    BoardProfile, BuildJob, BuildLogEntry, Component, DistributionStatus, DownloadJob, JobStatus,
    LogLevel, StageName, StageStatus,
};
use anyhow::Result;

pub trait BuildJobRepository: Send + Sync {
    fn create(&self, job: BuildJob) -> Result<()>;
    fn get_by_id(&self, id: &str) -> Result<Option<BuildJob>>;
    fn list_pending(&self) -> Result<Vec<BuildJob>>;

    fn mark_started(&self, id: &str) -> Result<()>;
    fn update_stage(&self, id: &str, stage: StageName, progress_percent: u8) -> Result<()>;
    fn update_stage_status(&self, id: &str, stage: StageName, status: StageStatus) -> Result<()>;
    fn mark_stage_completed(&self, id: &str, stage: StageName, duration_ms: u64) -> Result<()>;
    fn mark_stage_failed(&self, id: &str, stage: StageName, message: &str) -> Result<()>;

    fn append_log(&self, entry: BuildLogEntry) -> Result<()>;

    fn mark_completed(
        &self,
        id: &str,
        artifact_path: &str,
        artifact_checksum: &str,
        artifact_size: u64,
    ) -> Result<()>;
    fn mark_failed(&self, id: &str, stage: StageName, message: &str) -> Result<()>;
    /// Idempotent: a no-op on a job that is already terminal (spec §5
    /// Cancellation).
    fn mark_cancelled(&self, id: &str) -> Result<()>;
    fn increment_retry(&self, id: &str) -> Result<u32>;
}

pub trait DistributionRepository: Send + Sync {
    fn update_status(&self, id: &str, status: DistributionStatus, error: Option<&str>)
        -> Result<()>;
}

pub trait ComponentRepository: Send + Sync {
    fn find_by_name(&self, name: &str) -> Result<Option<Component>>;
}

pub trait SourceRepository: Send + Sync {
    /// Direct storage probe fallback used by Resolve step 4 when no
    /// completed download job exists for a component.
    fn find_source_id(&self, component_id: &str) -> Result<Option<String>>;
}

pub trait DownloadJobRepository: Send + Sync {
    fn find_completed(&self, component_id: &str, version: &str) -> Result<Option<DownloadJob>>;
}

pub trait BoardProfileRepository: Send + Sync {
    fn get_by_id(&self, id: &str) -> Result<Option<BoardProfile>>;
}

pub(crate) fn info_log(build_id: &str, stage: StageName, message: impl Into<String>) -> BuildLogEntry {
    log_entry(build_id, stage, LogLevel::Info, message)
}

pub(crate) fn warn_log(build_id: &str, stage: StageName, message: impl Into<String>) -> BuildLogEntry {
    log_entry(build_id, stage, LogLevel::Warn, message)
}

pub(crate) fn error_log(build_id: &str, stage: StageName, message: impl Into<String>) -> BuildLogEntry {
    log_entry(build_id, stage, LogLevel::Error, message)
}

fn log_entry(
    build_id: &str,
    stage: StageName,
    level: LogLevel,
    message: impl Into<String>,
) -> BuildLogEntry {
    BuildLogEntry {
        build_id: build_id.to_string(),
        stage,
        level,
        message: message.into(),
        created_at: time::OffsetDateTime::now_utc(),
    }
}
