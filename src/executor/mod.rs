//! Filesystem-operation helpers used by the Assemble stage (directories,
//! files, users/groups, OpenRC service enabling) plus the [`Executor`]
//! abstraction over isolated command execution (container backends or
//! host-direct/chroot, spec §4.1).

pub mod chroot;
pub mod container;
pub mod directories;
pub mod files;
pub mod openrc;
pub mod users;

use std::io::Write;

// ───────────────────────────────────────────────────────────────────────────
// The Executor abstraction (spec §4.1)
// ───────────────────────────────────────────────────────────────────────────

/// One requested bind mount: `source` (host path) → `target` (container or
/// sysroot-relative path).
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: std::path::PathBuf,
    pub target: std::path::PathBuf,
    pub read_only: bool,
}

/// Where captured stdout/stderr should go. `Capture` is used by stages that
/// need to parse output (the Compile container path's `[NN%]` progress
/// markers); `Inherit` streams directly to the parent process the way the
/// teacher's `run_interactive` does for long builds.
pub enum OutputSink {
    Capture,
    Inherit,
}

/// Options for a single `Executor::run` invocation (spec §4.1; the
/// authoritative option shape per spec §9's Open Question resolution:
/// `platform`, `stdout`, `stderr` live here, not on a separate
/// `ContainerRuntime` variant).
pub struct RunOptions {
    pub image: Option<String>,
    pub platform: Option<String>,
    pub mounts: Vec<Mount>,
    pub env: std::collections::BTreeMap<String, String>,
    pub command: Vec<String>,
    pub work_dir: Option<std::path::PathBuf>,
    pub privileged: bool,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            image: None,
            platform: None,
            mounts: Vec::new(),
            env: std::collections::BTreeMap::new(),
            command: Vec::new(),
            work_dir: None,
            privileged: false,
            stdout: OutputSink::Capture,
            stderr: OutputSink::Capture,
        }
    }
}

/// Result of a completed `Run`, with output captured whenever the
/// corresponding sink was `Capture`.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeType {
    Podman,
    Docker,
    Nerdctl,
    Chroot,
}

impl RuntimeType {
    pub fn is_container_runtime(&self) -> bool {
        !matches!(self, RuntimeType::Chroot)
    }
}

/// Uniform contract over the four backends (spec §4.1). Stages do not know
/// whether they are in a container or on the host; the compile stage is the
/// one stage that branches on `runtime_type().is_container_runtime()`.
pub trait Executor: Send + Sync {
    fn run(&self, opts: RunOptions) -> anyhow::Result<RunResult>;
    fn is_available(&self) -> bool;
    fn builder_image_exists(&self) -> anyhow::Result<bool>;
    fn default_image(&self) -> &str;
    fn runtime_type(&self) -> RuntimeType;
}

/// Construct the `Executor` for a build environment's configured runtime
/// (spec §4.3 "construct the Executor").
pub fn build_executor(
    runtime: crate::config::ContainerRuntime,
    container_image: String,
) -> Box<dyn Executor> {
    use crate::config::ContainerRuntime;
    match runtime {
        ContainerRuntime::Podman => Box::new(container::ContainerExecutor::new(
            container::ContainerBackend::Podman,
            container_image,
        )),
        ContainerRuntime::Docker => Box::new(container::ContainerExecutor::new(
            container::ContainerBackend::Docker,
            container_image,
        )),
        ContainerRuntime::Nerdctl => Box::new(container::ContainerExecutor::new(
            container::ContainerBackend::Nerdctl,
            container_image,
        )),
        ContainerRuntime::Chroot => Box::new(chroot::ChrootExecutor::new()),
    }
}

pub(crate) fn sink_output(result: &crate::process::CommandResult, out: &mut dyn Write) {
    let _ = out.write_all(result.stdout.as_bytes());
}
