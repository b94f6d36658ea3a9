//! Host toolchain validation (spec §4.5.1 Resolve step 6): when the
//! configured executor runs commands directly on the host rather than
//! inside a builder container, the cross-compiler for the job's target
//! must actually be on `PATH` before the pipeline commits to later stages.

use crate::model::BuildEnvironment;
use anyhow::{bail, Result};

/// Binaries the direct-compile path invokes, prefixed with the toolchain's
/// `cross_compile_prefix` (empty for a native build).
pub fn required_binaries(env: &BuildEnvironment) -> Vec<String> {
    let prefix = &env.toolchain.cross_compile_prefix;
    ["gcc", "ld", "objcopy", "ar"]
        .iter()
        .map(|bin| format!("{prefix}{bin}"))
        .collect()
}

/// Check every binary `required_binaries` names resolves on `PATH` via
/// `which`. Only meaningful for the chroot/native executor; container
/// executors carry their own toolchain inside the builder image.
pub fn validate_host_toolchain(env: &BuildEnvironment) -> Result<()> {
    let mut missing = Vec::new();
    for binary in required_binaries(env) {
        if which::which(&binary).is_err() {
            missing.push(binary);
        }
    }
    if !missing.is_empty() {
        bail!(
            "host toolchain missing required binaries: {}",
            missing.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QemuSupport, TargetArch, Toolchain};

    fn env_with_prefix(prefix: &str) -> BuildEnvironment {
        BuildEnvironment {
            host_arch: TargetArch::X86_64,
            target_arch: TargetArch::X86_64,
            is_native: prefix.is_empty(),
            toolchain: Toolchain {
                cross_compile_prefix: prefix.to_string(),
                make_arch: "x86".into(),
                toolchain_pkg: String::new(),
            },
            container_image: String::new(),
            container_platform_flag: String::new(),
            use_qemu_emulation: false,
            qemu_support: QemuSupport::default(),
        }
    }

    #[test]
    fn required_binaries_are_prefixed() {
        let env = env_with_prefix("aarch64-linux-gnu-");
        let bins = required_binaries(&env);
        assert_eq!(
            bins,
            vec![
                "aarch64-linux-gnu-gcc",
                "aarch64-linux-gnu-ld",
                "aarch64-linux-gnu-objcopy",
                "aarch64-linux-gnu-ar",
            ]
        );
    }

    #[test]
    fn native_toolchain_has_no_prefix() {
        let env = env_with_prefix("");
        let bins = required_binaries(&env);
        assert_eq!(bins, vec!["gcc", "ld", "objcopy", "ar"]);
    }

    #[test]
    fn validate_reports_all_missing_binaries_at_once() {
        let env = env_with_prefix("definitely-not-a-real-triplet-");
        let result = validate_host_toolchain(&env);
        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("gcc"));
        assert!(message.contains("ld"));
    }
}
