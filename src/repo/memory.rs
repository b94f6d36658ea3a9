//! In-memory reference implementations of the repository traits. These
//! exist purely to exercise the manager/worker/stage pipeline in tests
//! without a real database (spec §1 lists the relational store as an
//! external collaborator, out of scope as an implementation).

use super::traits::{
    BoardProfileRepository, BuildJobRepository, ComponentRepository, DistributionRepository,
    DownloadJobRepository, SourceRepository,
};
use crate::model::{
    BoardProfile, BuildJob, BuildLogEntry, Component, DistributionStatus, DownloadJob, JobStatus,
    StageName, StageStatus,
};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct InMemoryBuildJobRepository {
    jobs: Mutex<HashMap<String, BuildJob>>,
    logs: Mutex<Vec<BuildLogEntry>>,
}

impl InMemoryBuildJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs_for(&self, build_id: &str) -> Vec<BuildLogEntry> {
        self.logs
            .lock()
            .iter()
            .filter(|l| l.build_id == build_id)
            .cloned()
            .collect()
    }

    fn with_job<T>(&self, id: &str, f: impl FnOnce(&mut BuildJob) -> T) -> Result<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such build job: {id}"))?;
        Ok(f(job))
    }
}

impl BuildJobRepository for InMemoryBuildJobRepository {
    fn create(&self, job: BuildJob) -> Result<()> {
        self.jobs.lock().insert(job.id.clone(), job);
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> Result<Option<BuildJob>> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    fn list_pending(&self) -> Result<Vec<BuildJob>> {
        let mut pending: Vec<BuildJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending)
    }

    fn mark_started(&self, id: &str) -> Result<()> {
        self.with_job(id, |j| {
            j.status = JobStatus::Running;
            j.updated_at = time::OffsetDateTime::now_utc();
        })
    }

    fn update_stage(&self, id: &str, stage: StageName, progress_percent: u8) -> Result<()> {
        self.with_job(id, |j| {
            j.current_stage = Some(stage);
            j.progress_percent = progress_percent;
        })
    }

    fn update_stage_status(&self, _id: &str, _stage: StageName, _status: StageStatus) -> Result<()> {
        Ok(())
    }

    fn mark_stage_completed(&self, _id: &str, _stage: StageName, _duration_ms: u64) -> Result<()> {
        Ok(())
    }

    fn mark_stage_failed(&self, _id: &str, _stage: StageName, _message: &str) -> Result<()> {
        Ok(())
    }

    fn append_log(&self, entry: BuildLogEntry) -> Result<()> {
        self.logs.lock().push(entry);
        Ok(())
    }

    fn mark_completed(
        &self,
        id: &str,
        artifact_path: &str,
        artifact_checksum: &str,
        artifact_size: u64,
    ) -> Result<()> {
        self.with_job(id, |j| {
            j.status = JobStatus::Completed;
            j.artifact_path = Some(artifact_path.to_string());
            j.artifact_checksum = Some(artifact_checksum.to_string());
            j.artifact_size = Some(artifact_size);
            j.progress_percent = 100;
        })
    }

    fn mark_failed(&self, id: &str, stage: StageName, message: &str) -> Result<()> {
        self.with_job(id, |j| {
            if j.is_terminal() {
                return;
            }
            j.status = JobStatus::Failed;
            j.error_stage = Some(stage);
            j.error_message = Some(message.to_string());
        })
    }

    fn mark_cancelled(&self, id: &str) -> Result<()> {
        self.with_job(id, |j| {
            if j.is_terminal() {
                return;
            }
            j.status = JobStatus::Cancelled;
            j.error_message = Some("Build cancelled".to_string());
            j.error_stage = j.current_stage;
        })
    }

    fn increment_retry(&self, id: &str) -> Result<u32> {
        self.with_job(id, |j| {
            j.retry_count += 1;
            j.status = JobStatus::Pending;
            j.retry_count
        })
    }
}

#[derive(Default)]
pub struct InMemoryDistributionRepository {
    statuses: Mutex<HashMap<String, (DistributionStatus, Option<String>)>>,
}

impl InMemoryDistributionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, id: &str) -> Option<(DistributionStatus, Option<String>)> {
        self.statuses.lock().get(id).cloned()
    }
}

impl DistributionRepository for InMemoryDistributionRepository {
    fn update_status(
        &self,
        id: &str,
        status: DistributionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.statuses
            .lock()
            .insert(id.to_string(), (status, error.map(str::to_string)));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryComponentRepository {
    components: Mutex<HashMap<String, Component>>,
}

impl InMemoryComponentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, component: Component) {
        self.components.lock().insert(component.name.clone(), component);
    }
}

impl ComponentRepository for InMemoryComponentRepository {
    fn find_by_name(&self, name: &str) -> Result<Option<Component>> {
        Ok(self.components.lock().get(name).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySourceRepository {
    sources: Mutex<HashMap<String, String>>,
}

impl InMemorySourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, component_id: impl Into<String>, source_id: impl Into<String>) {
        self.sources.lock().insert(component_id.into(), source_id.into());
    }
}

impl SourceRepository for InMemorySourceRepository {
    fn find_source_id(&self, component_id: &str) -> Result<Option<String>> {
        Ok(self.sources.lock().get(component_id).cloned())
    }
}

/// Keyed by `"<component_id>@<version>"`.
#[derive(Default)]
pub struct InMemoryDownloadJobRepository {
    jobs: Mutex<HashMap<String, DownloadJob>>,
}

impl InMemoryDownloadJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: DownloadJob) {
        let key = format!("{}@{}", job.component_id, job.version);
        self.jobs.lock().insert(key, job);
    }
}

impl DownloadJobRepository for InMemoryDownloadJobRepository {
    fn find_completed(&self, component_id: &str, version: &str) -> Result<Option<DownloadJob>> {
        let key = format!("{component_id}@{version}");
        Ok(self
            .jobs
            .lock()
            .get(&key)
            .filter(|j| j.status == "completed")
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryBoardProfileRepository {
    profiles: Mutex<HashMap<String, BoardProfile>>,
}

impl InMemoryBoardProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: BoardProfile) {
        self.profiles.lock().insert(profile.id.clone(), profile);
    }
}

impl BoardProfileRepository for InMemoryBoardProfileRepository {
    fn get_by_id(&self, id: &str) -> Result<Option<BoardProfile>> {
        Ok(self.profiles.lock().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageFormat, TargetArch};

    fn sample_job(id: &str) -> BuildJob {
        let now = time::OffsetDateTime::now_utc();
        BuildJob {
            id: id.to_string(),
            distribution_id: "dist-1".into(),
            owner_id: "owner-1".into(),
            target_arch: TargetArch::X86_64,
            image_format: ImageFormat::Raw,
            status: JobStatus::Pending,
            current_stage: None,
            progress_percent: 0,
            artifact_path: None,
            artifact_checksum: None,
            artifact_size: None,
            error_message: None,
            error_stage: None,
            retry_count: 0,
            max_retries: 3,
            clear_cache: false,
            config_snapshot: "{}".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn mark_cancelled_is_idempotent_on_terminal_jobs() {
        let repo = InMemoryBuildJobRepository::new();
        repo.create(sample_job("b1")).unwrap();
        repo.mark_completed("b1", "path", "checksum", 10).unwrap();

        repo.mark_cancelled("b1").unwrap();
        let job = repo.get_by_id("b1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn mark_cancelled_sets_error_message_and_stage() {
        let repo = InMemoryBuildJobRepository::new();
        repo.create(sample_job("b2")).unwrap();
        repo.update_stage("b2", StageName::Prepare, 20).unwrap();

        repo.mark_cancelled("b2").unwrap();
        let job = repo.get_by_id("b2").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_message.as_deref(), Some("Build cancelled"));
        assert_eq!(job.error_stage, Some(StageName::Prepare));
    }

    #[test]
    fn list_pending_returns_oldest_first() {
        let repo = InMemoryBuildJobRepository::new();
        let mut a = sample_job("a");
        a.created_at = time::OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1);
        let mut b = sample_job("b");
        b.created_at = time::OffsetDateTime::UNIX_EPOCH;
        repo.create(a).unwrap();
        repo.create(b).unwrap();

        let pending = repo.list_pending().unwrap();
        assert_eq!(pending[0].id, "b");
        assert_eq!(pending[1].id, "a");
    }

    #[test]
    fn increment_retry_resets_to_pending() {
        let repo = InMemoryBuildJobRepository::new();
        repo.create(sample_job("c")).unwrap();
        repo.mark_failed("c", StageName::Compile, "boom").unwrap();

        let count = repo.increment_retry("c").unwrap();
        assert_eq!(count, 1);
        let job = repo.get_by_id("c").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}
