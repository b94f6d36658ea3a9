//! Host-direct and chroot execution (spec §4.1).
//!
//! Two modes: if `sysroot` is unset the command runs directly on the host,
//! inheriting the host environment overlaid with `opts.env`. Otherwise each
//! requested mount is bind-mounted under the sysroot, the command runs
//! under `chroot(2)` (via `pre_exec` in the spawned child, so only that
//! child's root changes), and on every exit path the mounts are unmounted
//! in reverse order of creation.

use super::{Executor, OutputSink, RunOptions, RunResult, RuntimeType};
use crate::error::BuildError;
use anyhow::{Context, Result};
use nix::mount::{mount as nix_mount, umount as nix_umount, MsFlags};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub struct ChrootExecutor {
    sysroot: Option<PathBuf>,
}

impl ChrootExecutor {
    pub fn new() -> Self {
        ChrootExecutor { sysroot: None }
    }

    pub fn with_sysroot(sysroot: PathBuf) -> Self {
        ChrootExecutor {
            sysroot: Some(sysroot),
        }
    }

    fn run_direct(&self, opts: RunOptions) -> Result<RunResult> {
        let (program, args) = opts
            .command
            .split_first()
            .ok_or_else(|| BuildError::ExecutorUnavailable("no command specified".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        if let Some(work_dir) = &opts.work_dir {
            cmd.current_dir(work_dir);
        }

        run_spawned(cmd, &opts)
    }

    fn run_chrooted(&self, sysroot: &Path, opts: RunOptions) -> Result<RunResult> {
        let (program, args) = opts
            .command
            .split_first()
            .ok_or_else(|| BuildError::ExecutorUnavailable("no command specified".into()))?;

        let mut mounted: Vec<PathBuf> = Vec::new();
        let result = (|| -> Result<RunResult> {
            for mount in &opts.mounts {
                let target = sysroot.join(
                    mount
                        .target
                        .strip_prefix("/")
                        .unwrap_or(&mount.target),
                );
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("creating bind target '{}'", target.display()))?;
                bind_mount(&mount.source, &target)?;
                mounted.push(target);
            }

            let sysroot_owned = sysroot.to_path_buf();
            let mut cmd = Command::new(program);
            cmd.args(args);
            for (key, value) in &opts.env {
                cmd.env(key, value);
            }
            let work_dir = opts
                .work_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/"));
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::chroot(&sysroot_owned)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    std::env::set_current_dir(&work_dir)?;
                    Ok(())
                });
            }

            run_spawned(cmd, &opts)
        })();

        // unmount in reverse order of creation on every exit path
        for target in mounted.into_iter().rev() {
            let _ = nix_umount(&target);
        }

        result
    }
}

fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    nix_mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind-mounting '{}' onto '{}'", source.display(), target.display()))
}

fn run_spawned(mut cmd: Command, opts: &RunOptions) -> Result<RunResult> {
    match (&opts.stdout, &opts.stderr) {
        (OutputSink::Inherit, _) | (_, OutputSink::Inherit) => {
            let status = cmd
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .context("spawning direct/chroot command")?;
            if !status.success() {
                anyhow::bail!("command exited with {status}");
            }
            Ok(RunResult::default())
        }
        _ => {
            let output = cmd
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .context("spawning direct/chroot command")?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if !output.status.success() {
                let tail: String = stderr.lines().rev().take(20).collect::<Vec<_>>().join("\n");
                anyhow::bail!("command failed: {}", tail);
            }
            Ok(RunResult { stdout, stderr })
        }
    }
}

impl Executor for ChrootExecutor {
    fn run(&self, opts: RunOptions) -> Result<RunResult> {
        if opts.command.is_empty() {
            return Err(BuildError::ExecutorUnavailable("no command specified".into()).into());
        }
        match &self.sysroot {
            None => self.run_direct(opts),
            Some(sysroot) => self.run_chrooted(sysroot, opts),
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn builder_image_exists(&self) -> Result<bool> {
        Ok(true)
    }

    fn default_image(&self) -> &str {
        ""
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Chroot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_mode_fails_with_no_command_specified() {
        let executor = ChrootExecutor::new();
        let opts = RunOptions::default();
        let result = executor.run(opts);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no command specified"));
    }

    #[test]
    fn direct_mode_runs_host_command_and_captures_output() {
        let executor = ChrootExecutor::new();
        let mut opts = RunOptions::default();
        opts.command = vec!["echo".into(), "hi".into()];
        let result = executor.run(opts).unwrap();
        assert_eq!(result.stdout.trim(), "hi");
    }

    #[test]
    fn runtime_type_is_chroot() {
        assert_eq!(ChrootExecutor::new().runtime_type(), RuntimeType::Chroot);
        assert!(!ChrootExecutor::new().runtime_type().is_container_runtime());
    }
}
