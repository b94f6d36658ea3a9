//! Persisted job/stage/log rows, and the external-collaborator types
//! (download jobs, components) the engine only reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetArch {
    X86_64,
    Aarch64,
}

impl TargetArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
        }
    }
}

impl std::fmt::Display for TargetArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Iso,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "img",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Iso => "iso",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Once terminal, the worker pool never re-enters the job (spec §3
    /// BuildJob invariant) until an explicit [`JobStatus::Pending`] reset
    /// via `Retry`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The six fixed pipeline stages, in their declared, never-reordered
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Resolve,
    Download,
    Prepare,
    Compile,
    Assemble,
    Package,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::Resolve,
        StageName::Download,
        StageName::Prepare,
        StageName::Compile,
        StageName::Assemble,
        StageName::Package,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Resolve => "resolve",
            StageName::Download => "download",
            StageName::Prepare => "prepare",
            StageName::Compile => "compile",
            StageName::Assemble => "assemble",
            StageName::Package => "package",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStage {
    pub id: String,
    pub build_id: String,
    pub name: StageName,
    pub status: StageStatus,
    pub progress_percent: u8,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub build_id: String,
    pub stage: StageName,
    pub level: LogLevel,
    pub message: String,
    pub created_at: time::OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: String,
    pub distribution_id: String,
    pub owner_id: String,
    pub target_arch: TargetArch,
    pub image_format: ImageFormat,
    pub status: JobStatus,
    pub current_stage: Option<StageName>,
    pub progress_percent: u8,
    pub artifact_path: Option<String>,
    pub artifact_checksum: Option<String>,
    pub artifact_size: Option<u64>,
    pub error_message: Option<String>,
    pub error_stage: Option<StageName>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub clear_cache: bool,
    /// Serialized `DistributionConfig` snapshot, taken at submission time so
    /// later edits to the distribution do not affect an in-flight build.
    pub config_snapshot: String,
    pub created_at: time::OffsetDateTime,
    pub updated_at: time::OffsetDateTime,
}

impl BuildJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// External: produced by the source-discovery/download subsystem. The
/// engine only reads these as evidence that a component's sources are
/// ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub component_id: String,
    #[serde(default)]
    pub component_ids: Vec<String>,
    pub version: String,
    pub status: String,
    pub artifact_path: Option<String>,
    pub error_message: Option<String>,
}

/// External: a catalog entry. An empty `supported_architectures` means
/// universal (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub name: String,
    pub category: String,
    pub default_version: String,
    #[serde(default)]
    pub supported_architectures: Vec<String>,
}

impl Component {
    pub fn supports(&self, arch: TargetArch) -> bool {
        self.supported_architectures.is_empty()
            || self
                .supported_architectures
                .iter()
                .any(|a| a == arch.as_str())
    }
}

/// Internal: a [`Component`] resolved to a concrete version and, after
/// Prepare extracts it, a local path.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    pub component: Component,
    pub version: String,
    pub artifact_path: Option<String>,
    pub local_path: Option<std::path::PathBuf>,
}
