//! The per-job bag threaded through the pipeline (spec §3 `StageContext`).
//! The Worker constructs one per job and owns it exclusively for that job's
//! duration; stages read the fields documented as their inputs and write
//! only the ones documented as their outputs.
//!
//! `services` is not named explicitly in spec §3's field list, but every
//! stage that looks anything up (Resolve's catalog/download-job/storage
//! probes, Package's upload) needs a handle to the collaborator traits the
//! Manager owns. Bundling them here rather than threading five extra
//! parameters through every `Stage::execute` call is the natural
//! generalization of how the teacher's `BuildContext` carried its
//! environment handles.

use crate::executor::Executor;
use crate::model::{
    BoardProfile, BuildEnvironment, DistributionConfig, ImageFormat, ResolvedComponent,
    StageName, TargetArch,
};
use crate::repo::{
    BoardProfileRepository, BuildJobRepository, ComponentRepository, DownloadJobRepository,
    SourceRepository,
};
use crate::store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Absolute paths for one job's persisted layout (spec §6):
/// `<workspace_base>/<build_id>/{sources,workspace,rootfs,output,config,scripts,logs}`.
#[derive(Debug, Clone)]
pub struct StagePaths {
    pub job_root: PathBuf,
    pub workspace: PathBuf,
    pub sources: PathBuf,
    pub rootfs: PathBuf,
    pub output: PathBuf,
    pub config: PathBuf,
    pub scripts: PathBuf,
    pub logs: PathBuf,
}

impl StagePaths {
    pub fn under(job_root: PathBuf) -> Self {
        StagePaths {
            workspace: job_root.join("workspace"),
            sources: job_root.join("sources"),
            rootfs: job_root.join("rootfs"),
            output: job_root.join("output"),
            config: job_root.join("config"),
            scripts: job_root.join("scripts"),
            logs: job_root.join("logs"),
            job_root,
        }
    }

    pub fn create_all(&self) -> anyhow::Result<()> {
        for dir in [
            &self.workspace,
            &self.sources,
            &self.rootfs,
            &self.output,
            &self.config,
            &self.scripts,
            &self.logs,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Collaborator handles a stage needs but that don't belong on the typed
/// fields spec §3 names directly.
pub struct Services {
    pub components: Arc<dyn ComponentRepository>,
    pub download_jobs: Arc<dyn DownloadJobRepository>,
    pub sources: Arc<dyn SourceRepository>,
    pub board_profiles: Arc<dyn BoardProfileRepository>,
    pub object_store: Arc<dyn ObjectStore>,
}

pub struct StageContext {
    pub build_id: String,
    pub distribution_id: String,
    pub owner_id: String,
    pub config: DistributionConfig,
    pub target_arch: TargetArch,
    pub image_format: ImageFormat,
    pub paths: StagePaths,
    pub job_repo: Arc<dyn BuildJobRepository>,
    pub services: Services,
    pub components: Vec<ResolvedComponent>,
    pub board_profile: Option<BoardProfile>,
    pub build_env: BuildEnvironment,
    pub executor: Box<dyn Executor>,

    pub artifact_path: Option<String>,
    pub artifact_checksum: Option<String>,
    pub artifact_size: Option<u64>,
}

impl StageContext {
    pub fn log_info(&self, stage: StageName, message: impl Into<String>) {
        let _ = self
            .job_repo
            .append_log(crate::repo::traits::info_log(&self.build_id, stage, message));
    }

    pub fn log_warn(&self, stage: StageName, message: impl Into<String>) {
        let _ = self
            .job_repo
            .append_log(crate::repo::traits::warn_log(&self.build_id, stage, message));
    }

    pub fn log_error(&self, stage: StageName, message: impl Into<String>) {
        let _ = self
            .job_repo
            .append_log(crate::repo::traits::error_log(&self.build_id, stage, message));
    }
}
