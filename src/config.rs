//! Process-wide configuration, re-read at the start of every job (spec §6,
//! §9 "globally mutable settings singleton" redesign note: no singleton —
//! the worker takes a snapshot of this type at job start instead of reading
//! it once at construction).
//!
//! Loaded from a TOML file the way `pipeline::config::load_boot_config` in
//! the teacher loads `01Boot.toml`: a `#[derive(Deserialize)]` struct,
//! `toml::from_str`, and `~` expansion on path-shaped fields via `dirs`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Podman,
    Docker,
    Nerdctl,
    Chroot,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        ContainerRuntime::Podman
    }
}

fn default_workers() -> usize {
    4
}

fn default_workspace_base() -> String {
    "~/.cache/ldf-engine/builds".to_string()
}

fn default_container_image() -> String {
    "ldf-engine/builder".to_string()
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildConfigFile {
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_workspace_base")]
    workspace_base: String,
    #[serde(default)]
    container_runtime: ContainerRuntime,
    #[serde(default = "default_container_image")]
    container_image: String,
    #[serde(default = "default_retry_delay_secs")]
    retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

impl Default for BuildConfigFile {
    fn default() -> Self {
        BuildConfigFile {
            workers: default_workers(),
            workspace_base: default_workspace_base(),
            container_runtime: ContainerRuntime::default(),
            container_image: default_container_image(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    build: BuildConfigFile,
}

/// Process-wide settings snapshot. `Manager::start` reads this once at
/// spawn time for pool sizing; `Worker` re-reads container runtime/image
/// (the "Live config" requirement, spec §4.3) at the start of every job.
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub workspace_base: PathBuf,
    pub container_runtime: ContainerRuntime,
    pub container_image: String,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_file(BuildConfigFile::default())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;
        let parsed: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parsing config file '{}'", path.display()))?;
        Ok(Config::from_file(parsed.build))
    }

    /// Load from the default location, falling back to built-in defaults if
    /// no file is present (not an error: a fresh install has none yet).
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Config::load(path)
        } else {
            Ok(Config::default())
        }
    }

    fn from_file(raw: BuildConfigFile) -> Self {
        Config {
            workers: raw.workers.max(1),
            workspace_base: expand_tilde(&raw.workspace_base),
            container_runtime: raw.container_runtime,
            container_image: raw.container_image,
            retry_delay: Duration::from_secs(raw.retry_delay_secs),
            max_retries: raw.max_retries,
        }
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.container_runtime, ContainerRuntime::Podman);
        assert_eq!(config.retry_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ldf.toml");
        std::fs::write(
            &path,
            "[build]\nworkers = 8\ncontainer_runtime = \"chroot\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.container_runtime, ContainerRuntime::Chroot);
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let config = Config::load_or_default(Path::new("/nonexistent/ldf.toml")).unwrap();
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn tilde_expands_against_home() {
        let expanded = expand_tilde("~/.cache/ldf-engine/builds");
        assert!(expanded.is_absolute());
    }
}
