//! Container backend executors: one generic [`ContainerExecutor`]
//! parameterized by a [`ContainerBackend`] tag rather than three near-
//! identical structs, per spec §9's note on avoiding deep trait
//! hierarchies for per-variant dispatch.

use super::{Executor, Mount, OutputSink, RunOptions, RunResult, RuntimeType};
use crate::process::Cmd;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerBackend {
    Podman,
    Docker,
    Nerdctl,
}

impl ContainerBackend {
    fn binary(&self) -> &'static str {
        match self {
            ContainerBackend::Podman => "podman",
            ContainerBackend::Docker => "docker",
            ContainerBackend::Nerdctl => "nerdctl",
        }
    }

    fn runtime_type(&self) -> RuntimeType {
        match self {
            ContainerBackend::Podman => RuntimeType::Podman,
            ContainerBackend::Docker => RuntimeType::Docker,
            ContainerBackend::Nerdctl => RuntimeType::Nerdctl,
        }
    }
}

pub struct ContainerExecutor {
    backend: ContainerBackend,
    default_image: String,
}

impl ContainerExecutor {
    pub fn new(backend: ContainerBackend, default_image: String) -> Self {
        ContainerExecutor {
            backend,
            default_image,
        }
    }

    fn mount_flag(mount: &Mount) -> String {
        let mode = if mount.read_only { "ro" } else { "rw" };
        format!(
            "{}:{}:{}",
            mount.source.display(),
            mount.target.display(),
            mode
        )
    }
}

impl Executor for ContainerExecutor {
    fn run(&self, opts: RunOptions) -> Result<RunResult> {
        let image = opts.image.clone().unwrap_or_else(|| self.default_image.clone());

        let mut cmd = Cmd::new(self.backend.binary()).args(["run", "--rm"]);

        if opts.privileged {
            cmd = cmd.arg("--privileged");
        }
        if let Some(platform) = &opts.platform {
            cmd = cmd.args(["--platform", platform]);
        }
        if let Some(work_dir) = &opts.work_dir {
            cmd = cmd.arg("-w").arg_path(work_dir);
        }
        for mount in &opts.mounts {
            cmd = cmd.args(["-v", &Self::mount_flag(mount)]);
        }
        for (key, value) in &opts.env {
            cmd = cmd.args(["-e", &format!("{key}={value}")]);
        }

        cmd = cmd.arg(&image);
        cmd = cmd.args(&opts.command);
        cmd = cmd.error_msg(format!(
            "{} run failed for image '{}'",
            self.backend.binary(),
            image
        ));

        match (&opts.stdout, &opts.stderr) {
            (OutputSink::Inherit, _) | (_, OutputSink::Inherit) => {
                cmd.run_interactive()?;
                Ok(RunResult::default())
            }
            _ => {
                let result = cmd.run()?;
                Ok(RunResult {
                    stdout: result.stdout,
                    stderr: result.stderr,
                })
            }
        }
    }

    fn is_available(&self) -> bool {
        Cmd::new("which")
            .arg(self.backend.binary())
            .allow_fail()
            .run()
            .map(|r| r.success())
            .unwrap_or(false)
    }

    fn builder_image_exists(&self) -> Result<bool> {
        let result = Cmd::new(self.backend.binary())
            .args(["image", "exists"])
            .arg(&self.default_image)
            .allow_fail()
            .run()?;
        Ok(result.success())
    }

    fn default_image(&self) -> &str {
        &self.default_image
    }

    fn runtime_type(&self) -> RuntimeType {
        self.backend.runtime_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_flag_formats_read_only() {
        let mount = Mount {
            source: "/host/src".into(),
            target: "/build/src".into(),
            read_only: true,
        };
        assert_eq!(
            ContainerExecutor::mount_flag(&mount),
            "/host/src:/build/src:ro"
        );
    }

    #[test]
    fn runtime_type_matches_backend() {
        let executor = ContainerExecutor::new(ContainerBackend::Podman, "img".into());
        assert_eq!(executor.runtime_type(), RuntimeType::Podman);
        assert!(executor.runtime_type().is_container_runtime());
    }
}
