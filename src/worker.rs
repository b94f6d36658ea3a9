//! Drives one job through all six stages, reporting progress and handling
//! cancellation and panics (spec §4.3).
//!
//! A single `Worker` is shared (via `Arc`) across every worker thread the
//! `Manager` spawns: it holds no per-job mutable state of its own, only the
//! collaborator handles every job needs. Per-job state lives entirely in
//! the `StageContext` the worker builds fresh for each job.

use crate::arch;
use crate::config::{Config, ContainerRuntime};
use crate::context::{Services, StageContext, StagePaths};
use crate::error::BuildError;
use crate::executor::{self, Executor};
use crate::model::{
    BuildJob, DistributionConfig, DistributionStatus, JobStatus, StageName, StageStatus,
};
use crate::repo::{
    BoardProfileRepository, BuildJobRepository, ComponentRepository, DistributionRepository,
    DownloadJobRepository, SourceRepository,
};
use crate::stages::{self, Stage};
use crate::store::ObjectStore;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Per-job cancellation flag. Cheap to clone; `Manager` hands one out per
/// submitted job and keeps the other end in its cancel registry (spec §5
/// "Cancellation": message-passing into a shared token, never direct
/// thread manipulation).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one `Worker::process` call, used only for logging/testing —
/// the persisted job row is the source of truth for callers.
#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub struct Worker {
    pub(crate) config: Arc<RwLock<Config>>,
    pub(crate) job_repo: Arc<dyn BuildJobRepository>,
    pub(crate) distributions: Arc<dyn DistributionRepository>,
    pub(crate) components: Arc<dyn ComponentRepository>,
    pub(crate) download_jobs: Arc<dyn DownloadJobRepository>,
    pub(crate) sources: Arc<dyn SourceRepository>,
    pub(crate) board_profiles: Arc<dyn BoardProfileRepository>,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) stages: Arc<Vec<Box<dyn Stage>>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<Config>>,
        job_repo: Arc<dyn BuildJobRepository>,
        distributions: Arc<dyn DistributionRepository>,
        components: Arc<dyn ComponentRepository>,
        download_jobs: Arc<dyn DownloadJobRepository>,
        sources: Arc<dyn SourceRepository>,
        board_profiles: Arc<dyn BoardProfileRepository>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Worker {
            config,
            job_repo,
            distributions,
            components,
            download_jobs,
            sources,
            board_profiles,
            object_store,
            stages: Arc::new(stages::pipeline()),
        }
    }

    /// Process one job start-to-finish. Never panics: a panic anywhere in
    /// stage code is caught at this boundary, converted to an `Internal`
    /// failure attributed to the stage that was running, and the worker
    /// returns normally so it can keep serving the queue (spec §4.3 "Panic
    /// safety", §9 "Panic containment").
    pub fn process(&self, job_id: &str, cancel: &CancelToken) -> JobOutcome {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(job_id, cancel)));
        match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                // `run` already recorded the failure on the job/stage rows
                // before returning; this is just the worker's bookkeeping.
                tracing_log_fallback(job_id, &err);
                JobOutcome::Failed
            }
            Err(panic) => {
                let message = panic_message(&panic);
                let stage = self
                    .job_repo
                    .get_by_id(job_id)
                    .ok()
                    .flatten()
                    .and_then(|j| j.current_stage)
                    .unwrap_or(StageName::Resolve);
                let _ = self.job_repo.mark_stage_failed(job_id, stage, &message);
                let _ = self.job_repo.mark_failed(job_id, stage, &message);
                if let Ok(Some(job)) = self.job_repo.get_by_id(job_id) {
                    let _ = self.distributions.update_status(
                        &job.distribution_id,
                        DistributionStatus::Failed,
                        Some(&message),
                    );
                }
                JobOutcome::Failed
            }
        }
    }

    fn run(&self, job_id: &str, cancel: &CancelToken) -> Result<JobOutcome> {
        let job = self
            .job_repo
            .get_by_id(job_id)
            .context("loading build job")?
            .ok_or_else(|| BuildError::Internal(format!("no such build job: {job_id}")))?;

        if job.is_terminal() {
            return Ok(match job.status {
                JobStatus::Completed => JobOutcome::Completed,
                JobStatus::Cancelled => JobOutcome::Cancelled,
                _ => JobOutcome::Failed,
            });
        }

        // Live config: re-read on every job start so operators can change
        // the container runtime/image without restarting (spec §4.3).
        let config_snapshot = self.config.read().clone();

        self.job_repo.mark_started(job_id)?;
        let _ = self
            .distributions
            .update_status(&job.distribution_id, DistributionStatus::Building, None);

        let dist_config: DistributionConfig = serde_json::from_str(&job.config_snapshot)
            .context("deserializing distribution config snapshot")?;

        let host_arch = arch::detect_host_arch();
        let mut build_env =
            arch::validate_build_environment(host_arch, job.target_arch, &config_snapshot.container_image)
                .map_err(|e| self.fail(&job, StageName::Resolve, &e.to_string()))?;
        if config_snapshot.container_runtime == ContainerRuntime::Chroot {
            build_env.container_image.clear();
        }

        let executor_runtime = config_snapshot.container_runtime;
        let executor = executor::build_executor(executor_runtime, build_env.container_image.clone());
        if executor_runtime != ContainerRuntime::Chroot && !executor.is_available() {
            let message = format!("{executor_runtime:?} executor is not available on this host");
            return Err(self.fail(&job, StageName::Resolve, &message));
        }

        let job_root = config_snapshot.workspace_base.join(job_id);
        let paths = StagePaths::under(job_root);
        paths.create_all().context("creating workspace directories")?;

        for stage in self.stages.iter() {
            self.job_repo
                .update_stage_status(job_id, stage.name(), StageStatus::Pending)?;
        }

        let mut ctx = StageContext {
            build_id: job.id.clone(),
            distribution_id: job.distribution_id.clone(),
            owner_id: job.owner_id.clone(),
            config: dist_config,
            target_arch: job.target_arch,
            image_format: job.image_format,
            paths,
            job_repo: Arc::clone(&self.job_repo),
            services: Services {
                components: Arc::clone(&self.components),
                download_jobs: Arc::clone(&self.download_jobs),
                sources: Arc::clone(&self.sources),
                board_profiles: Arc::clone(&self.board_profiles),
                object_store: Arc::clone(&self.object_store),
            },
            components: Vec::new(),
            board_profile: None,
            build_env,
            executor,
            artifact_path: None,
            artifact_checksum: None,
            artifact_size: None,
        };

        let total = self.stages.len();
        for (i, stage) in self.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.cancel_job(&job, &ctx.paths.job_root));
            }

            let overall_start = ((i * 100) / total) as u8;
            self.job_repo
                .update_stage(job_id, stage.name(), overall_start)?;
            self.job_repo
                .update_stage_status(job_id, stage.name(), StageStatus::Running)?;
            ctx.log_info(stage.name(), format!("Starting stage {}", stage.name()));

            if let Err(err) = stage.validate(&ctx) {
                let message = err.to_string();
                ctx.log_error(stage.name(), &message);
                self.job_repo
                    .mark_stage_failed(job_id, stage.name(), &message)?;
                return Ok(self.record_failure(&job, stage.name(), &message, &ctx.paths.job_root));
            }

            let started_at = Instant::now();
            let job_repo = Arc::clone(&self.job_repo);
            let build_id = job_id.to_string();
            let stage_name = stage.name();
            let mut progress_cb = move |percent: u8, message: &str| {
                let overall = ((i * 100 + percent as usize) / total) as u8;
                let _ = job_repo.update_stage(&build_id, stage_name, overall);
                if !message.is_empty() {
                    let _ = job_repo.append_log(crate::repo::traits::info_log(
                        &build_id, stage_name, message,
                    ));
                }
            };

            if let Err(err) = stage.execute(&mut ctx, &mut progress_cb) {
                let message = err.to_string();
                ctx.log_error(stage.name(), &message);
                self.job_repo
                    .mark_stage_failed(job_id, stage.name(), &message)?;
                return Ok(self.record_failure(&job, stage.name(), &message, &ctx.paths.job_root));
            }

            let elapsed_ms = started_at.elapsed().as_millis() as u64;
            self.job_repo
                .mark_stage_completed(job_id, stage.name(), elapsed_ms)?;
            ctx.log_info(stage.name(), format!("Stage completed in {elapsed_ms}ms"));
        }

        let artifact_path = ctx
            .artifact_path
            .clone()
            .ok_or_else(|| BuildError::Internal("Package stage produced no artifact_path".into()))?;
        let artifact_checksum = ctx.artifact_checksum.clone().ok_or_else(|| {
            BuildError::Internal("Package stage produced no artifact_checksum".into())
        })?;
        let artifact_size = ctx
            .artifact_size
            .ok_or_else(|| BuildError::Internal("Package stage produced no artifact_size".into()))?;

        self.job_repo
            .mark_completed(job_id, &artifact_path, &artifact_checksum, artifact_size)?;
        let _ = self
            .distributions
            .update_status(&job.distribution_id, DistributionStatus::Ready, None);
        ctx.log_info(
            StageName::Package,
            format!("Build completed, artifact size {artifact_size} bytes"),
        );

        if job.clear_cache {
            remove_workspace(&ctx.paths.job_root, &ctx);
        }

        Ok(JobOutcome::Completed)
    }

    /// Records a cancellation at the current checkpoint (spec §5): the job
    /// ends `failed` with `error_message="Build cancelled"` and the stage
    /// that was running, workspace removed.
    fn cancel_job(&self, job: &BuildJob, job_root: &std::path::Path) -> JobOutcome {
        let stage = self
            .job_repo
            .get_by_id(&job.id)
            .ok()
            .flatten()
            .and_then(|j| j.current_stage)
            .unwrap_or(StageName::Resolve);
        let _ = self.job_repo.mark_failed(&job.id, stage, "Build cancelled");
        let _ = self.distributions.update_status(
            &job.distribution_id,
            DistributionStatus::Failed,
            Some("Build cancelled"),
        );
        let _ = std::fs::remove_dir_all(job_root);
        JobOutcome::Cancelled
    }

    fn record_failure(
        &self,
        job: &BuildJob,
        stage: StageName,
        message: &str,
        job_root: &std::path::Path,
    ) -> JobOutcome {
        let _ = self.job_repo.mark_failed(&job.id, stage, message);
        let _ = self.distributions.update_status(
            &job.distribution_id,
            DistributionStatus::Failed,
            Some(message),
        );
        let _ = std::fs::remove_dir_all(job_root);
        JobOutcome::Failed
    }

    /// Early-failure helper for errors raised before a `StageContext` (and
    /// thus `ctx.log_*`) exists yet — executor/environment setup.
    fn fail(&self, job: &BuildJob, stage: StageName, message: &str) -> anyhow::Error {
        let _ = self.job_repo.mark_stage_failed(&job.id, stage, message);
        self.record_failure(job, stage, message, &self.workspace_root_guess(job));
        anyhow::anyhow!("{message}")
    }

    fn workspace_root_guess(&self, job: &BuildJob) -> std::path::PathBuf {
        self.config.read().workspace_base.join(&job.id)
    }
}

fn remove_workspace(job_root: &std::path::Path, ctx: &StageContext) {
    if let Err(err) = std::fs::remove_dir_all(job_root) {
        ctx.log_warn(
            StageName::Package,
            format!("failed to remove workspace '{}': {err}", job_root.display()),
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic in stage: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic in stage: {s}")
    } else {
        "panic in stage: <non-string payload>".to_string()
    }
}

fn tracing_log_fallback(_job_id: &str, _err: &anyhow::Error) {
    // Structured failures are persisted through `BuildLogEntry`/the job
    // row already; nothing further to do here. Kept as an explicit no-op
    // seam so a future process-level diagnostic sink has somewhere to
    // plug in without touching `run`'s control flow.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageFormat, TargetArch};
    use crate::repo::memory::{
        InMemoryBoardProfileRepository, InMemoryBuildJobRepository, InMemoryComponentRepository,
        InMemoryDistributionRepository, InMemoryDownloadJobRepository, InMemorySourceRepository,
    };
    use crate::store::LocalObjectStore;

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn processing_unknown_job_id_fails_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(RwLock::new(Config {
            workspace_base: tmp.path().to_path_buf(),
            ..Config::default()
        }));
        let worker = Worker::new(
            config,
            Arc::new(InMemoryBuildJobRepository::new()),
            Arc::new(InMemoryDistributionRepository::new()),
            Arc::new(InMemoryComponentRepository::new()),
            Arc::new(InMemoryDownloadJobRepository::new()),
            Arc::new(InMemorySourceRepository::new()),
            Arc::new(InMemoryBoardProfileRepository::new()),
            Arc::new(LocalObjectStore::new(tmp.path().join("store"))),
        );
        let outcome = worker.process("does-not-exist", &CancelToken::new());
        assert_eq!(outcome, JobOutcome::Failed);
    }

    #[test]
    fn already_terminal_job_is_left_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let job_repo = Arc::new(InMemoryBuildJobRepository::new());
        let now = time::OffsetDateTime::now_utc();
        job_repo
            .create(BuildJob {
                id: "b1".into(),
                distribution_id: "d1".into(),
                owner_id: "o1".into(),
                target_arch: TargetArch::X86_64,
                image_format: ImageFormat::Raw,
                status: JobStatus::Completed,
                current_stage: None,
                progress_percent: 100,
                artifact_path: Some("k".into()),
                artifact_checksum: Some("c".into()),
                artifact_size: Some(1),
                error_message: None,
                error_stage: None,
                retry_count: 0,
                max_retries: 3,
                clear_cache: false,
                config_snapshot: "{}".into(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let config = Arc::new(RwLock::new(Config {
            workspace_base: tmp.path().to_path_buf(),
            ..Config::default()
        }));
        let worker = Worker::new(
            config,
            job_repo,
            Arc::new(InMemoryDistributionRepository::new()),
            Arc::new(InMemoryComponentRepository::new()),
            Arc::new(InMemoryDownloadJobRepository::new()),
            Arc::new(InMemorySourceRepository::new()),
            Arc::new(InMemoryBoardProfileRepository::new()),
            Arc::new(LocalObjectStore::new(tmp.path().join("store"))),
        );
        let outcome = worker.process("b1", &CancelToken::new());
        assert_eq!(outcome, JobOutcome::Completed);
    }
}
