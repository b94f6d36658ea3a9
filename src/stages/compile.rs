//! Compile stage (spec §4.5.4): build the kernel, branching on whether the
//! configured executor is a container runtime (isolated build inside the
//! builder image) or direct/chroot (the kernel's own build system runs
//! against the host's toolchain).

use super::{ProgressFn, Stage};
use crate::context::StageContext;
use crate::error::BuildError;
use crate::executor::{Mount, OutputSink, RunOptions};
use crate::kernelconfig::KernelConfigService;
use crate::model::distribution::ConfigMode;
use crate::model::{StageName, TargetArch};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct CompileStage;

fn kernel_component(ctx: &StageContext) -> Option<&crate::model::ResolvedComponent> {
    ctx.components.iter().find(|c| c.component.name == "linux")
}

fn kernel_image_target(arch: TargetArch) -> &'static str {
    match arch {
        TargetArch::X86_64 => "bzImage",
        TargetArch::Aarch64 => "Image",
    }
}

fn boot_arch_dir(arch: TargetArch) -> &'static str {
    match arch {
        TargetArch::X86_64 => "x86",
        TargetArch::Aarch64 => "arm64",
    }
}

/// The defconfig make target for the non-`custom` config-synthesis branch
/// (spec §4.5.4 step 1): x86 family always uses `x86_64_defconfig`; aarch64
/// uses a board-specific target when a board profile is attached, else the
/// architecture's generic `defconfig`.
fn defconfig_target(target_arch: TargetArch, board_profile: Option<&crate::model::BoardProfile>) -> String {
    match target_arch {
        TargetArch::X86_64 => "x86_64_defconfig".to_string(),
        TargetArch::Aarch64 => match board_profile {
            Some(board) => format!("{}_defconfig", board.name),
            None => "defconfig".to_string(),
        },
    }
}

/// Strip `# LDF…`/`LDF_…` metadata lines ldf-engine's own synthesis prefixes
/// onto every stored config artifact (spec §4.5.4 step 1, `custom` branch).
fn strip_ldf_header(config: &str) -> String {
    config
        .lines()
        .filter(|line| !line.starts_with("# LDF") && !line.starts_with("LDF_"))
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Produce the final `.config` content for the kernel tree, given the stored
/// fragment's classification (spec §4.5.4 step 1 + §4.6). `generate_baseline`
/// is invoked only for the non-`custom` branch and must return the kernel
/// tree's `.config` after the arch defconfig target has been run against it.
fn synthesize_kernel_config(
    board_profile: Option<&crate::model::BoardProfile>,
    fragment_raw: &str,
    baseline: impl FnOnce() -> Result<String>,
) -> Result<String> {
    let mode = KernelConfigService::classify(fragment_raw).unwrap_or(ConfigMode::Defconfig);
    if mode == ConfigMode::Custom {
        return Ok(strip_ldf_header(fragment_raw));
    }

    let baseline = baseline()?;
    let fragment = KernelConfigService::parse_fragment(fragment_raw);
    let mut merged = KernelConfigService::merge_into_kernel_config(&baseline, &fragment);

    if let Some(board) = board_profile {
        if !board.config.kernel_overlay.is_empty() {
            merged = KernelConfigService::merge_into_kernel_config(&merged, &board.config.kernel_overlay);
        }
    }

    Ok(merged)
}

fn num_cpus_heuristic() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Extract `NN` from a kbuild-style `"[ NN%] building ..."` progress line.
fn extract_percent(line: &str) -> Option<u8> {
    let start = line.find('[')?;
    let end = line[start..].find('%')? + start;
    line[start + 1..end].trim().parse().ok()
}

/// Pull progress checkpoints out of captured kbuild output (spec §4.5.4:
/// the container path has no other channel back to the worker than the
/// command's captured stdout once it exits).
fn parse_make_progress(stdout: &str) -> Vec<(u8, String)> {
    stdout
        .lines()
        .filter_map(|line| extract_percent(line).map(|pct| (pct, line.trim().to_string())))
        .collect()
}

/// Run one step of the container build as a mounted bash script (spec
/// §4.5.4: `{kernel_src, config_dir, output_dir, scripts_dir}` mounted,
/// `{ARCH, CROSS_COMPILE, NPROC=0}` env, the resolved `container_image` plus
/// `platform_flag`).
fn run_container_script(ctx: &StageContext, kernel_src: &Path, script: &str, name: &str) -> Result<String> {
    std::fs::create_dir_all(&ctx.paths.scripts)?;
    let script_path = ctx.paths.scripts.join(name);
    std::fs::write(&script_path, script)?;

    let opts = RunOptions {
        image: Some(ctx.build_env.container_image.clone()),
        platform: (!ctx.build_env.container_platform_flag.is_empty())
            .then(|| ctx.build_env.container_platform_flag.clone()),
        mounts: vec![
            Mount { source: kernel_src.to_path_buf(), target: PathBuf::from("/build/src"), read_only: false },
            Mount { source: ctx.paths.config.clone(), target: PathBuf::from("/build/config"), read_only: true },
            Mount { source: ctx.paths.output.clone(), target: PathBuf::from("/build/output"), read_only: false },
            Mount { source: ctx.paths.scripts.clone(), target: PathBuf::from("/build/scripts"), read_only: true },
        ],
        env: [
            ("ARCH".to_string(), ctx.build_env.toolchain.make_arch.clone()),
            ("CROSS_COMPILE".to_string(), ctx.build_env.toolchain.cross_compile_prefix.clone()),
            ("NPROC".to_string(), "0".to_string()),
        ]
        .into_iter()
        .collect(),
        command: vec!["sh".into(), format!("/build/scripts/{name}")],
        work_dir: None,
        privileged: false,
        stdout: OutputSink::Capture,
        stderr: OutputSink::Capture,
    };

    let result = ctx.executor.run(opts).map_err(|e| BuildError::MakeError(e.to_string()))?;
    Ok(result.stdout)
}

/// Container path (spec §4.5.4): the config-merge logic for the detected
/// mode runs as pure code against the kernel tree's own generated
/// `.config`, the same algorithm the direct path uses (spec §4.6), since
/// `kernel_src` is a bind mount visible to this process both before and
/// after each container invocation. Only the `make` invocations themselves
/// (which need the container's cross toolchain) happen inside the
/// container; the non-`custom` branch therefore runs in two scripted steps
/// with the merge in between.
fn compile_in_container(ctx: &StageContext, kernel_src: &Path, progress: &mut ProgressFn) -> Result<()> {
    let jobs = num_cpus_heuristic();
    let image_target = kernel_image_target(ctx.target_arch);
    let boot_dir = boot_arch_dir(ctx.target_arch);

    let fragment_raw = std::fs::read_to_string(ctx.paths.config.join(".config"))
        .context("reading synthesized kernel config fragment")?;
    let baseline_path = kernel_src.join(".config");

    progress(5, "synthesizing kernel config");
    let target = defconfig_target(ctx.target_arch, ctx.board_profile.as_ref());
    let merged = synthesize_kernel_config(ctx.board_profile.as_ref(), &fragment_raw, || {
        let defconfig_script = format!(
            "set -e\ncd /build/src\nexport ARCH={arch}\nexport CROSS_COMPILE={prefix}\nmake {target}\n",
            arch = ctx.build_env.toolchain.make_arch,
            prefix = ctx.build_env.toolchain.cross_compile_prefix,
        );
        run_container_script(ctx, kernel_src, &defconfig_script, "defconfig.sh")?;
        std::fs::read_to_string(&baseline_path).context("reading generated .config")
    })?;
    std::fs::write(&baseline_path, merged).context("writing merged .config")?;

    progress(30, "building kernel image");
    let build_script = format!(
        "set -e\n\
         cd /build/src\n\
         export ARCH={arch}\n\
         export CROSS_COMPILE={prefix}\n\
         make olddefconfig\n\
         make -j{jobs} {image_target}\n\
         make -j{jobs} modules\n\
         make modules_install INSTALL_MOD_PATH=/build/output/modules\n\
         mkdir -p /build/output/boot\n\
         cp arch/{boot_dir}/boot/{image_target} /build/output/boot/vmlinuz 2>/dev/null || cp {image_target} /build/output/boot/vmlinuz\n\
         cp System.map /build/output/boot/\n\
         cp .config /build/output/boot/\n",
        arch = ctx.build_env.toolchain.make_arch,
        prefix = ctx.build_env.toolchain.cross_compile_prefix,
        jobs = jobs,
        image_target = image_target,
        boot_dir = boot_dir,
    );
    let stdout = run_container_script(ctx, kernel_src, &build_script, "build.sh")?;

    for (pct, message) in parse_make_progress(&stdout) {
        progress(pct, &message);
    }

    Ok(())
}

fn run_make(ctx: &StageContext, kernel_src: &Path, args: &[&str]) -> Result<()> {
    let mut command = vec!["make".to_string()];
    command.extend(args.iter().map(|s| s.to_string()));

    let opts = RunOptions {
        image: None,
        platform: None,
        mounts: Vec::new(),
        env: [
            ("ARCH".to_string(), ctx.build_env.toolchain.make_arch.clone()),
            ("CROSS_COMPILE".to_string(), ctx.build_env.toolchain.cross_compile_prefix.clone()),
        ]
        .into_iter()
        .collect(),
        command,
        work_dir: Some(kernel_src.to_path_buf()),
        privileged: false,
        stdout: OutputSink::Inherit,
        stderr: OutputSink::Inherit,
    };

    ctx.executor
        .run(opts)
        .map(|_| ())
        .map_err(|e| BuildError::MakeError(e.to_string()).into())
}

fn compile_direct(ctx: &StageContext, kernel_src: &Path, progress: &mut ProgressFn) -> Result<()> {
    let jobs = num_cpus_heuristic().to_string();
    let image_target = kernel_image_target(ctx.target_arch);

    progress(5, "synthesizing kernel config");
    let baseline_path = kernel_src.join(".config");
    let fragment_raw = std::fs::read_to_string(ctx.paths.config.join(".config"))
        .context("reading synthesized kernel config fragment")?;
    let target = defconfig_target(ctx.target_arch, ctx.board_profile.as_ref());
    let merged = synthesize_kernel_config(ctx.board_profile.as_ref(), &fragment_raw, || {
        run_make(ctx, kernel_src, &[&target]).context("make defconfig")?;
        std::fs::read_to_string(&baseline_path).context("reading generated .config")
    })?;
    std::fs::write(&baseline_path, merged).context("writing merged .config")?;

    progress(25, "normalizing merged config");
    run_make(ctx, kernel_src, &["olddefconfig"]).context("make olddefconfig")?;

    progress(35, "building kernel image");
    run_make(ctx, kernel_src, &["-j", &jobs, image_target]).context("make image")?;

    progress(65, "building modules");
    run_make(ctx, kernel_src, &["-j", &jobs, "modules"]).context("make modules")?;

    progress(80, "installing modules");
    let modules_dest = ctx.paths.output.join("modules");
    std::fs::create_dir_all(&modules_dest)?;
    run_make(
        ctx,
        kernel_src,
        &["modules_install", &format!("INSTALL_MOD_PATH={}", modules_dest.display())],
    )
    .context("make modules_install")?;

    let boot_out = ctx.paths.output.join("boot");
    std::fs::create_dir_all(&boot_out)?;

    if let Some(board_profile) = &ctx.board_profile {
        if !board_profile.config.device_trees.is_empty() {
            progress(88, "building device trees");
            build_device_trees(ctx, kernel_src, &boot_out, &board_profile.config.device_trees)?;
        }
    }

    progress(92, "staging boot artifacts");
    let arch_boot = kernel_src.join(format!("arch/{}/boot", boot_arch_dir(ctx.target_arch)));
    let image_src = arch_boot.join(image_target);
    let image_src = if image_src.exists() { image_src } else { kernel_src.join(image_target) };
    std::fs::copy(&image_src, boot_out.join("vmlinuz"))
        .with_context(|| format!("copying built kernel image from '{}'", image_src.display()))?;
    std::fs::copy(kernel_src.join("System.map"), boot_out.join("System.map"))
        .context("copying System.map")?;
    std::fs::copy(kernel_src.join(".config"), boot_out.join(".config"))
        .context("copying final .config")?;

    Ok(())
}

/// Build and stage each board device tree (spec §4.5.4 step 7): one
/// `<source>.dtb` target per entry plus one `<overlay>.dtbo` target per
/// declared overlay, copied into `<output>/boot/dtbs/` and
/// `<output>/boot/overlays/` respectively.
fn build_device_trees(
    ctx: &StageContext,
    kernel_src: &Path,
    boot_out: &Path,
    device_trees: &[crate::model::distribution::DeviceTreeOverlay],
) -> Result<()> {
    let dtbs_dir = boot_out.join("dtbs");
    let overlays_dir = boot_out.join("overlays");
    std::fs::create_dir_all(&dtbs_dir)?;

    for dt in device_trees {
        let dtb_target = format!("{}.dtb", dt.source);
        run_make(ctx, kernel_src, &[&dtb_target]).with_context(|| format!("make {dtb_target}"))?;
        stage_built_dt_file(kernel_src, &dt.source, "dtb", &dtbs_dir)?;

        if !dt.overlays.is_empty() {
            std::fs::create_dir_all(&overlays_dir)?;
        }
        for overlay in &dt.overlays {
            let dtbo_target = format!("{overlay}.dtbo");
            run_make(ctx, kernel_src, &[&dtbo_target]).with_context(|| format!("make {dtbo_target}"))?;
            stage_built_dt_file(kernel_src, overlay, "dtbo", &overlays_dir)?;
        }
    }

    Ok(())
}

/// `make <name>.<ext>` places the built file somewhere under
/// `arch/*/boot/dts/**`; locate it by filename rather than assuming a fixed
/// vendor subdirectory, and copy it to `dest_dir`.
fn stage_built_dt_file(kernel_src: &Path, name: &str, ext: &str, dest_dir: &Path) -> Result<()> {
    let filename = format!("{name}.{ext}");
    let found = walkdir::WalkDir::new(kernel_src.join("arch"))
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == filename)
        .ok_or_else(|| BuildError::Internal(format!("built device-tree file '{filename}' not found")))?;
    std::fs::copy(found.path(), dest_dir.join(&filename))
        .with_context(|| format!("copying '{filename}' to '{}'", dest_dir.display()))?;
    Ok(())
}

impl Stage for CompileStage {
    fn name(&self) -> StageName {
        StageName::Compile
    }

    fn validate(&self, ctx: &StageContext) -> Result<()> {
        let kernel = kernel_component(ctx)
            .ok_or_else(|| BuildError::Internal("no kernel component resolved".into()))?;
        if kernel.local_path.is_none() {
            return Err(BuildError::Internal("kernel component has no local path; prepare did not run".into()).into());
        }
        let config_path = ctx.paths.config.join(".config");
        if !config_path.exists() {
            return Err(BuildError::ArtifactMissing("kernel .config not found".into()).into());
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<()> {
        let kernel_src = kernel_component(ctx)
            .and_then(|c| c.local_path.clone())
            .ok_or_else(|| BuildError::Internal("no kernel component resolved".into()))?;

        if ctx.executor.runtime_type().is_container_runtime() {
            compile_in_container(ctx, &kernel_src, progress)?;
        } else {
            compile_direct(ctx, &kernel_src, progress)?;
        }

        progress(100, "compile complete");
        Ok(())
    }
}
