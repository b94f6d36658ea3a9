//! Cross-architecture build planning (spec §4.2): computes a
//! [`BuildEnvironment`] following the native > cross-compile >
//! foreign-arch-via-emulation priority, replacing the teacher's `qemu.rs`
//! VM test harness (a different concern entirely — running a built image
//! under qemu to smoke-test it, not planning the build's own toolchain).

use crate::model::{BuildEnvironment, QemuSupport, TargetArch, Toolchain};
use crate::process::Cmd;
use anyhow::{bail, Result};
use std::path::Path;

/// Detect the host architecture the way `std::env::consts::ARCH` would
/// report it, defaulting to `x86_64` on anything unrecognized (spec §4.2
/// step 1).
pub fn detect_host_arch() -> TargetArch {
    match std::env::consts::ARCH {
        "aarch64" => TargetArch::Aarch64,
        _ => TargetArch::X86_64,
    }
}

fn lookup_toolchain(host: TargetArch, target: TargetArch) -> Result<Toolchain> {
    use TargetArch::*;
    Ok(match (host, target) {
        (X86_64, X86_64) => Toolchain {
            cross_compile_prefix: String::new(),
            make_arch: "x86".into(),
            toolchain_pkg: String::new(),
        },
        (Aarch64, Aarch64) => Toolchain {
            cross_compile_prefix: String::new(),
            make_arch: "arm64".into(),
            toolchain_pkg: String::new(),
        },
        (X86_64, Aarch64) => Toolchain {
            cross_compile_prefix: "aarch64-linux-gnu-".into(),
            make_arch: "arm64".into(),
            toolchain_pkg: "gcc-aarch64-linux-gnu".into(),
        },
        (Aarch64, X86_64) => Toolchain {
            cross_compile_prefix: "x86_64-linux-gnu-".into(),
            make_arch: "x86".into(),
            toolchain_pkg: "gcc-x86-64-linux-gnu".into(),
        },
    })
}

fn resolve_container_image(base: &str, target_arch: TargetArch) -> String {
    // try `<base>:<target_arch>` first; if `base` already has a tag, prefer
    // the tag the caller supplied, else fall back to `base:latest`.
    if base.contains(':') {
        return base.to_string();
    }
    format!("{base}:{}", target_arch.as_str())
}

fn qemu_binary_name(target_arch: TargetArch) -> &'static str {
    match target_arch {
        TargetArch::X86_64 => "qemu-x86_64",
        TargetArch::Aarch64 => "qemu-aarch64",
    }
}

fn binfmt_registration_path(target_arch: TargetArch) -> &'static str {
    match target_arch {
        TargetArch::X86_64 => "/proc/sys/fs/binfmt_misc/qemu-x86_64",
        TargetArch::Aarch64 => "/proc/sys/fs/binfmt_misc/qemu-aarch64",
    }
}

fn platform_flag(target_arch: TargetArch) -> &'static str {
    match target_arch {
        TargetArch::X86_64 => "linux/amd64",
        TargetArch::Aarch64 => "linux/arm64",
    }
}

fn probe_emulation(target_arch: TargetArch) -> QemuSupport {
    let binary_name = qemu_binary_name(target_arch);
    let binary_path = Cmd::new("which")
        .arg(binary_name)
        .allow_fail()
        .run()
        .ok()
        .filter(|r| r.success())
        .map(|r| r.stdout.trim().to_string());

    let binfmt_registered = Path::new(binfmt_registration_path(target_arch)).exists();

    QemuSupport {
        available: binary_path.is_some(),
        binfmt_registered,
        binary_path,
    }
}

/// Compute the `BuildEnvironment` for a job (spec §4.2, `ValidateBuildEnvironment`).
pub fn validate_build_environment(
    host_arch: TargetArch,
    target_arch: TargetArch,
    container_image_base: &str,
) -> Result<BuildEnvironment> {
    let toolchain = lookup_toolchain(host_arch, target_arch)?;
    let is_native = host_arch == target_arch;
    let container_image = resolve_container_image(container_image_base, target_arch);

    if is_native {
        return Ok(BuildEnvironment {
            host_arch,
            target_arch,
            is_native,
            toolchain,
            container_image,
            container_platform_flag: String::new(),
            use_qemu_emulation: false,
            qemu_support: QemuSupport::default(),
        });
    }

    let qemu_support = probe_emulation(target_arch);
    let use_qemu_emulation = qemu_support.available && qemu_support.binfmt_registered;
    let container_platform_flag = if use_qemu_emulation {
        platform_flag(target_arch).to_string()
    } else {
        String::new()
    };

    Ok(BuildEnvironment {
        host_arch,
        target_arch,
        is_native,
        toolchain,
        container_image,
        container_platform_flag,
        use_qemu_emulation,
        qemu_support,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_build_has_empty_prefix_and_platform_flag() {
        let env = validate_build_environment(TargetArch::X86_64, TargetArch::X86_64, "ldf/builder")
            .unwrap();
        assert!(env.is_native);
        assert!(env.toolchain.cross_compile_prefix.is_empty());
        assert!(env.container_platform_flag.is_empty());
        assert_eq!(env.toolchain.make_arch, "x86");
    }

    #[test]
    fn cross_compile_x86_to_aarch64_has_expected_prefix() {
        let env =
            validate_build_environment(TargetArch::X86_64, TargetArch::Aarch64, "ldf/builder")
                .unwrap();
        assert!(!env.is_native);
        assert_eq!(env.toolchain.cross_compile_prefix, "aarch64-linux-gnu-");
        assert_eq!(env.toolchain.make_arch, "arm64");
    }

    #[test]
    fn cross_compile_aarch64_to_x86_has_expected_prefix() {
        let env =
            validate_build_environment(TargetArch::Aarch64, TargetArch::X86_64, "ldf/builder")
                .unwrap();
        assert_eq!(env.toolchain.cross_compile_prefix, "x86_64-linux-gnu-");
        assert_eq!(env.toolchain.make_arch, "x86");
    }

    #[test]
    fn container_image_gets_arch_tag_when_base_has_none() {
        let env =
            validate_build_environment(TargetArch::X86_64, TargetArch::Aarch64, "ldf/builder")
                .unwrap();
        assert_eq!(env.container_image, "ldf/builder:aarch64");
    }

    #[test]
    fn container_image_with_existing_tag_is_untouched() {
        let env = validate_build_environment(
            TargetArch::X86_64,
            TargetArch::Aarch64,
            "ldf/builder:custom",
        )
        .unwrap();
        assert_eq!(env.container_image, "ldf/builder:custom");
    }

    #[test]
    fn emulation_flag_only_set_when_both_binary_and_binfmt_present() {
        // On a host with no qemu-user binaries registered, cross-compiling
        // must still succeed, just without emulation.
        let env =
            validate_build_environment(TargetArch::X86_64, TargetArch::Aarch64, "ldf/builder")
                .unwrap();
        if !env.use_qemu_emulation {
            assert!(env.container_platform_flag.is_empty());
        } else {
            assert!(["linux/amd64", "linux/arm64"].contains(&env.container_platform_flag.as_str()));
        }
    }
}
