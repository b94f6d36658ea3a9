//! Kernel `.config` artifact synthesis and merge (spec §4.6).
//!
//! Generates one of three artifacts at distribution commit time
//! (`defconfig`/`options`/`custom`), and provides the compile-time merge
//! algorithm the direct (chroot/host) compile path runs against a real
//! kernel tree's `.config`.

use crate::model::distribution::ConfigMode;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Recommended options table, keyed by a coarse selector. Real tables would
/// be considerably larger; this carries the universal defaults plus the
/// selectors spec §4.6 names explicitly (filesystem type, init system,
/// security system, virtualization, container presence).
pub fn recommended_options(
    filesystem_type: &str,
    init_system: &str,
    security_system: &str,
    has_virtualization: bool,
    has_container: bool,
) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();

    // universal defaults
    options.insert("CONFIG_BLK_DEV_LOOP".into(), "y".into());
    options.insert("CONFIG_TMPFS".into(), "y".into());
    options.insert("CONFIG_OVERLAY_FS".into(), "y".into());
    options.insert("CONFIG_PROC_FS".into(), "y".into());
    options.insert("CONFIG_SYSFS".into(), "y".into());

    match filesystem_type {
        "ext4" => {
            options.insert("CONFIG_EXT4_FS".into(), "y".into());
        }
        "btrfs" => {
            options.insert("CONFIG_BTRFS_FS".into(), "m".into());
        }
        "xfs" => {
            options.insert("CONFIG_XFS_FS".into(), "y".into());
        }
        _ => {}
    }

    match init_system {
        "systemd" => {
            options.insert("CONFIG_CGROUPS".into(), "y".into());
            options.insert("CONFIG_FHANDLE".into(), "y".into());
        }
        "openrc" => {
            options.insert("CONFIG_CGROUPS".into(), "y".into());
        }
        _ => {}
    }

    match security_system {
        "selinux" => {
            options.insert("CONFIG_SECURITY_SELINUX".into(), "y".into());
        }
        "apparmor" => {
            options.insert("CONFIG_SECURITY_APPARMOR".into(), "y".into());
        }
        _ => {
            options.insert("CONFIG_SECURITY_SELINUX".into(), "n".into());
            options.insert("CONFIG_SECURITY_APPARMOR".into(), "n".into());
        }
    }

    if has_virtualization {
        options.insert("CONFIG_KVM".into(), "m".into());
        options.insert("CONFIG_VIRTIO".into(), "y".into());
    }

    if has_container {
        options.insert("CONFIG_NAMESPACES".into(), "y".into());
        options.insert("CONFIG_NET_NS".into(), "y".into());
        options.insert("CONFIG_CGROUP_PIDS".into(), "y".into());
    }

    options
}

/// Merge user overrides on top of the recommended set (`options` mode:
/// user wins). Pure function, key-order independent (spec §8 round-trip
/// law).
pub fn merge(
    recommended: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = recommended.clone();
    merged.extend(overrides.clone());
    merged
}

fn format_value(key: &str, value: &str) -> String {
    match value {
        "y" | "m" => format!("{key}={value}"),
        "n" => format!("# {key} is not set"),
        other if other.starts_with('"') => format!("{key}={other}"),
        other => format!("{key}=\"{other}\""),
    }
}

/// Render a sorted-by-key options map into `.config` assignment lines
/// (spec §4.6: "emitted sorted by key for determinism").
pub fn render_options(options: &BTreeMap<String, String>) -> String {
    options
        .iter()
        .map(|(k, v)| format_value(k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

fn metadata_header(mode: ConfigMode, target_arch: Option<&str>) -> String {
    let mode_str = match mode {
        ConfigMode::Defconfig => "defconfig",
        ConfigMode::Options => "options",
        ConfigMode::Custom => "custom",
    };
    let mut header = String::from("# Generated by ldf-engine. Do not edit by hand.\n");
    header.push_str(&format!("LDF_CONFIG_MODE={mode_str}\n"));
    if let Some(arch) = target_arch {
        header.push_str(&format!("LDF_TARGET_ARCH={arch}\n"));
    }
    header.push('\n');
    header
}

/// Generate the kernel config artifact for `defconfig`/`options` modes, or
/// prefix a user-supplied file for `custom` (spec §4.6).
pub struct KernelConfigService;

impl KernelConfigService {
    /// `defconfig` or `options` mode: recommended table, optionally merged
    /// with user overrides.
    pub fn generate(
        mode: ConfigMode,
        target_arch: &str,
        filesystem_type: &str,
        init_system: &str,
        security_system: &str,
        has_virtualization: bool,
        has_container: bool,
        overrides: &BTreeMap<String, String>,
    ) -> Result<String> {
        if mode == ConfigMode::Custom {
            anyhow::bail!("KernelConfigService::generate does not handle custom mode; use generate_custom");
        }
        let recommended = recommended_options(
            filesystem_type,
            init_system,
            security_system,
            has_virtualization,
            has_container,
        );
        let options = match mode {
            ConfigMode::Options => merge(&recommended, overrides),
            ConfigMode::Defconfig => recommended,
            ConfigMode::Custom => unreachable!(),
        };

        let mut out = metadata_header(mode, Some(target_arch));
        out.push_str(&render_options(&options));
        out.push('\n');
        Ok(out)
    }

    /// `custom` mode: the user-supplied file content, prefixed with the
    /// metadata header.
    pub fn generate_custom(custom_config: &str, target_arch: &str) -> String {
        let mut out = metadata_header(ConfigMode::Custom, Some(target_arch));
        out.push_str(custom_config);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    /// Classify a stored fragment by reading its `LDF_CONFIG_MODE=` header
    /// line (spec §4.5.4 Preflight).
    pub fn classify(fragment: &str) -> Result<ConfigMode> {
        for line in fragment.lines() {
            if let Some(value) = line.strip_prefix("LDF_CONFIG_MODE=") {
                return match value.trim() {
                    "defconfig" => Ok(ConfigMode::Defconfig),
                    "options" => Ok(ConfigMode::Options),
                    "custom" => Ok(ConfigMode::Custom),
                    other => anyhow::bail!("unknown LDF_CONFIG_MODE value: {other}"),
                };
            }
        }
        anyhow::bail!("fragment has no LDF_CONFIG_MODE header")
    }

    /// Parse a stored fragment's option assignments into a map, skipping
    /// blanks, `#` comments (other than `# KEY is not set` lines, which
    /// parse to `"n"`), and `LDF_` metadata.
    pub fn parse_fragment(fragment: &str) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        for line in fragment.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("LDF_") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("# ") {
                if let Some(key) = rest.strip_suffix(" is not set") {
                    options.insert(key.to_string(), "n".to_string());
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                options.insert(key.to_string(), value.trim_matches('"').to_string());
            }
        }
        options
    }

    /// Compile-time merge (spec §4.6): rewrite matching lines of the
    /// kernel's own `.config` in place (pass 1), then append any unseen
    /// options (pass 2).
    pub fn merge_into_kernel_config(kernel_config: &str, fragment: &BTreeMap<String, String>) -> String {
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut lines: Vec<String> = Vec::new();

        for line in kernel_config.lines() {
            let matched_key = fragment.keys().find(|key| {
                line.starts_with(&format!("{key}=")) || line == format!("# {key} is not set")
            });
            if let Some(key) = matched_key {
                lines.push(format_value(key, &fragment[key.as_str()]));
                seen.insert(key.as_str());
            } else {
                lines.push(line.to_string());
            }
        }

        for (key, value) in fragment {
            if !seen.contains(key.as_str()) {
                lines.push(format_value(key, value));
            }
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Apply the stored fragment to a real kernel tree's `.config` file on
    /// disk, leaving `make olddefconfig` to the caller (stages/compile.rs),
    /// since that requires an executor invocation this module has no
    /// business performing.
    pub fn apply_fragment_to_file(kernel_config_path: &Path, fragment: &str) -> Result<()> {
        let options = Self::parse_fragment(fragment);
        let current = std::fs::read_to_string(kernel_config_path)
            .with_context(|| format!("reading '{}'", kernel_config_path.display()))?;
        let merged = Self::merge_into_kernel_config(&current, &options);
        std::fs::write(kernel_config_path, merged)
            .with_context(|| format!("writing '{}'", kernel_config_path.display()))?;
        Ok(())
    }
}
