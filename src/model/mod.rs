//! The data model threaded through the build engine: the declarative
//! distribution config supplied by the caller, the persisted job/stage/log
//! rows the manager and worker maintain, and the internal, per-job
//! [`env::BuildEnvironment`] and [`crate::context::StageContext`].
//!
//! These are plain data types (`Debug`, `Clone`, `Serialize`/`Deserialize`
//! where they cross a storage or wire boundary) with no behavior of their
//! own; the behavior lives in the stages, the planner, and the kernel
//! config service that operate on them.

pub mod distribution;
pub mod env;
pub mod job;

pub use distribution::{BoardProfile, Distribution, DistributionConfig, DistributionStatus};
pub use env::{BuildEnvironment, QemuSupport, Toolchain};
pub use job::{
    BuildJob, BuildLogEntry, BuildStage, Component, DownloadJob, ImageFormat, JobStatus, LogLevel,
    ResolvedComponent, StageName, StageStatus, TargetArch,
};
