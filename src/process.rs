//! Thin wrapper around [`std::process::Command`] used throughout the engine.
//!
//! Every external tool invocation (`make`, `mksquashfs`, `xorriso`, `dd`,
//! `sfdisk`, container runtime CLIs, ...) goes through [`Cmd`] so that
//! failures carry a captured stderr tail and a caller-supplied message,
//! rather than a bare `ExitStatus`.

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

/// Result of running a command to completion with captured output.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Builder for a single external command invocation.
pub struct Cmd {
    inner: Command,
    program: String,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let program_str = program.as_ref().to_string_lossy().to_string();
        Cmd {
            inner: Command::new(program),
            program: program_str,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.inner.arg(arg);
        self
    }

    pub fn arg_path(mut self, path: impl AsRef<Path>) -> Self {
        self.inner.arg(path.as_ref().as_os_str());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.inner.env(key, value);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.current_dir(dir);
        self
    }

    /// Message used to prefix the error when the command fails and
    /// `allow_fail` was not set.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Don't turn a non-zero exit into an `Err`; the caller inspects
    /// `CommandResult::success()` themselves.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run the command, capturing stdout/stderr, returning an error unless
    /// `allow_fail()` was set (in which case non-zero exits are returned as
    /// `Ok` for the caller to inspect).
    pub fn run(mut self) -> Result<CommandResult> {
        let output = self
            .inner
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning '{}'", self.program))?;

        let result = CommandResult {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let tail = tail_lines(&result.stderr, 20);
            let prefix = self.error_msg.take().unwrap_or_else(|| {
                format!("command '{}' failed", self.program)
            });
            bail!("{}: {}", prefix, tail);
        }

        Ok(result)
    }

    /// Run the command inheriting the parent's stdio, for long-running
    /// builds where the caller wants to see live output (e.g. `make`).
    pub fn run_interactive(mut self) -> Result<()> {
        let status = self
            .inner
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("spawning '{}'", self.program))?;

        if !status.success() && !self.allow_fail {
            let prefix = self.error_msg.take().unwrap_or_else(|| {
                format!("command '{}' failed", self.program)
            });
            bail!("{}: exit status {}", prefix, status);
        }

        Ok(())
    }
}

/// Run a shell one-liner through `sh -c`, for small pipelines that are
/// awkward to express as a single argv (e.g. `find | cpio | gzip`).
pub fn shell(script: &str) -> Result<CommandResult> {
    Cmd::new("sh")
        .args(["-c", script])
        .error_msg("shell command failed")
        .run()
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= n {
        text.trim().to_string()
    } else {
        lines[lines.len() - n..].join("\n")
    }
}

/// Verify a path exists, bailing with a descriptive message otherwise.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at '{}'", what, path.display());
    }
    Ok(())
}

/// Return the first candidate path that exists, if any.
pub fn find_first_existing<'a>(candidates: &'a [std::path::PathBuf]) -> Option<&'a Path> {
    candidates.iter().map(|p| p.as_path()).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn run_fails_on_nonzero_exit() {
        let result = Cmd::new("false").error_msg("false failed").run();
        assert!(result.is_err());
    }

    #[test]
    fn allow_fail_returns_ok_on_nonzero_exit() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn ensure_exists_reports_missing_path() {
        let result = ensure_exists(Path::new("/nonexistent/path/xyz"), "thing");
        assert!(result.is_err());
    }
}
