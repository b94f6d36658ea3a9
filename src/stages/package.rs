//! Package stage (spec §4.5.6): turn the assembled root filesystem into a
//! bootable disk image (raw, qcow2, or iso), checksum it, and upload it to
//! object storage.

use super::{ProgressFn, Stage};
use crate::artifact::disk::helpers::{self, generate_disk_uuids};
use crate::artifact::disk::{LoopDevice, Mount as DiskMount};
use crate::artifact::iso_utils;
use crate::artifact::squashfs::{build_squashfs, SquashfsOptions};
use crate::context::StageContext;
use crate::error::BuildError;
use crate::executor::chroot::ChrootExecutor;
use crate::executor::{Executor, OutputSink, RunOptions};
use crate::model::{ImageFormat, StageName, TargetArch};
use crate::process::Cmd;
use crate::store::traits::content_type_for;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub struct PackageStage;

const ESP_SIZE_MB: u64 = 512;
const SECTOR_SIZE: u64 = 512;

fn grub_target(arch: TargetArch) -> &'static str {
    match arch {
        TargetArch::X86_64 => "x86_64-efi",
        TargetArch::Aarch64 => "arm64-efi",
    }
}

fn efi_stub_name(arch: TargetArch) -> &'static str {
    match arch {
        TargetArch::X86_64 => "BOOTX64.EFI",
        TargetArch::Aarch64 => "BOOTAA64.EFI",
    }
}

// ─── raw image (and the base of qcow2) ─────────────────────────────────────

fn build_raw_image(ctx: &mut StageContext, progress: &mut ProgressFn, ceiling: u8) -> Result<PathBuf> {
    let size_gb = ctx.config.core.partitioning.size_gb() as u64;
    let image_path = ctx.paths.output.join("disk.img");

    helpers::check_host_tools(&[("qemu-img", "qemu-img")])
        .context("checking host tools for raw image assembly")?;

    Cmd::new("truncate")
        .arg("-s")
        .arg(format!("{size_gb}G"))
        .arg_path(&image_path)
        .error_msg("allocating sparse disk image")
        .run()?;
    progress(ceiling.min(10), "allocated sparse disk image");

    let esp_sectors = ESP_SIZE_MB * 1024 * 1024 / SECTOR_SIZE;
    let sfdisk_script = format!(
        "sfdisk '{path}' <<'EOF'\n\
         label: gpt\n\
         unit: sectors\n\
         \n\
         start=2048, size={esp_sectors}, type=U, name=\"ESP\"\n\
         type=L, name=\"root\"\n\
         EOF\n",
        path = image_path.display(),
    );
    crate::process::shell(&sfdisk_script).context("partitioning disk image with sfdisk")?;

    let mut loop_dev = LoopDevice::attach(&image_path).context("attaching loop device")?;
    let esp_part = loop_dev.partition(1);
    let root_part = loop_dev.partition(2);
    progress(ceiling.min(20), "partitioned and attached loop device");

    let uuids = generate_disk_uuids().context("generating disk UUIDs")?;
    let vfat_serial = helpers::generate_vfat_serial()?.replace('-', "");

    Cmd::new("mkfs.vfat")
        .arg("-F").arg("32")
        .arg("-n").arg("ESP")
        .arg("-i").arg(&vfat_serial)
        .arg_path(&esp_part)
        .error_msg("formatting ESP partition")
        .run()?;
    Cmd::new("mkfs.ext4")
        .arg("-U").arg(&uuids.root_fs_uuid)
        .arg("-L").arg("root")
        .arg_path(&root_part)
        .error_msg("formatting root partition")
        .run()?;
    progress(ceiling.min(30), "filesystems formatted");

    let mount_root = ctx.paths.workspace.join("mnt-root");
    std::fs::create_dir_all(&mount_root)?;
    let mut root_mount = DiskMount::mount(&root_part, &mount_root).context("mounting root partition")?;

    let esp_mountpoint = mount_root.join("boot/efi");
    std::fs::create_dir_all(&esp_mountpoint)?;
    let mut esp_mount = DiskMount::mount(&esp_part, &esp_mountpoint).context("mounting ESP partition")?;

    Cmd::new("rsync")
        .arg("-aAX")
        .arg(format!("{}/", ctx.paths.rootfs.display()))
        .arg_path(&mount_root)
        .error_msg("copying rootfs onto disk image")
        .run()?;
    progress(((ceiling as u32 * 7) / 9) as u8, "rootfs copied onto disk image");

    let chroot_executor = ChrootExecutor::with_sysroot(mount_root.clone());
    let grub_install = RunOptions {
        image: None,
        platform: None,
        mounts: Vec::new(),
        env: Default::default(),
        command: vec![
            "grub-install".into(),
            format!("--target={}", grub_target(ctx.target_arch)),
            "--efi-directory=/boot/efi".into(),
            "--bootloader-id=GRUB".into(),
            "--removable".into(),
        ],
        work_dir: None,
        privileged: true,
        stdout: OutputSink::Capture,
        stderr: OutputSink::Capture,
    };
    chroot_executor
        .run(grub_install)
        .map_err(|e| BuildError::PartitioningError(format!("grub-install failed: {e}")))?;
    progress(ceiling.saturating_sub(5).min(ceiling), "bootloader installed");

    Cmd::new("sync").error_msg("syncing disk image").run()?;
    esp_mount.unmount().context("unmounting ESP partition")?;
    root_mount.unmount().context("unmounting root partition")?;
    loop_dev.detach().context("detaching loop device")?;
    progress(ceiling, "raw image assembled");

    Ok(image_path)
}

fn build_qcow2_image(ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<PathBuf> {
    let raw_path = build_raw_image(ctx, progress, 80)?;
    let qcow2_path = ctx.paths.output.join("disk.qcow2");

    Cmd::new("qemu-img")
        .arg("convert")
        .arg("-f").arg("raw")
        .arg("-O").arg("qcow2")
        .arg("-c")
        .arg_path(&raw_path)
        .arg_path(&qcow2_path)
        .error_msg("converting raw image to qcow2")
        .run()?;
    std::fs::remove_file(&raw_path).context("removing intermediate raw image")?;
    progress(90, "qcow2 image generated");

    Ok(qcow2_path)
}

// ─── iso ────────────────────────────────────────────────────────────────────

fn build_iso_image(ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<PathBuf> {
    let iso_root = ctx.paths.workspace.join("iso-root");
    iso_utils::setup_iso_structure(&iso_root).context("setting up ISO staging structure")?;
    progress(10, "ISO staging structure created");

    let boot_src = ctx.paths.rootfs.join("boot");
    let iso_boot = iso_root.join("boot");
    std::fs::create_dir_all(&iso_boot)?;
    for name in ["vmlinuz", "initramfs.img"] {
        let src = boot_src.join(name);
        if src.exists() {
            std::fs::copy(&src, iso_boot.join(name))
                .with_context(|| format!("copying '{name}' onto ISO staging"))?;
        }
    }
    progress(25, "kernel and initramfs staged");

    let squashfs_path = iso_root.join("LiveOS/squashfs.img");
    if let Some(parent) = squashfs_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    build_squashfs(&ctx.paths.rootfs, &squashfs_path, &SquashfsOptions::default())
        .context("building squashfs rootfs image")?;
    progress(60, "rootfs squashed");

    let label = format!("{}-{}", ctx.distribution_id, ctx.build_id);
    let grub_cfg = format!(
        "set timeout=5\nset default=0\n\n\
         menuentry \"Linux (live)\" {{\n\
         \tlinux /boot/vmlinuz root=live:CDLABEL={label} rootfstype=iso9660 rd.live.image\n\
         \tinitrd /boot/initramfs.img\n\
         }}\n"
    );
    std::fs::write(iso_root.join("boot/grub/grub.cfg"), grub_cfg).context("writing ISO grub config")?;
    progress(70, "ISO bootloader configuration written");

    let stub_name = efi_stub_name(ctx.target_arch);
    let efi_stub_src = ctx
        .paths
        .rootfs
        .join("boot/efi/EFI/BOOT")
        .join(format!("{stub_name}.placeholder"));
    let efiboot_path = iso_root.join("boot/efiboot.img");
    let efi_dest_rel = format!("EFI/BOOT/{stub_name}");
    if efi_stub_src.exists() {
        iso_utils::create_efi_boot_image(&efiboot_path, &[(efi_stub_src.as_path(), efi_dest_rel.as_str())])
            .context("building EFI boot image")?;
    }
    progress(85, "EFI boot image staged");

    let iso_path = ctx.paths.output.join(format!("{}.iso", ctx.distribution_id));
    iso_utils::run_xorriso(&iso_root, &iso_path, &label, "boot/efiboot.img")
        .context("running xorriso to produce final ISO")?;
    progress(90, "ISO image generated");

    Ok(iso_path)
}

// ─── checksum + upload ──────────────────────────────────────────────────────

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("opening '{}' for checksum", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn upload_artifact(ctx: &mut StageContext, image_path: &Path) -> Result<()> {
    let filename = image_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BuildError::Internal("artifact path has no filename".into()))?
        .to_string();

    let checksum = sha256_file(image_path).context("computing artifact checksum")?;
    let size = std::fs::metadata(image_path)?.len();

    let key = format!(
        "distribution/{}/{}/builds/{}/{}",
        ctx.owner_id, ctx.distribution_id, ctx.build_id, filename
    );
    let content_type = content_type_for(&filename);

    let mut file = std::fs::File::open(image_path)?;
    ctx.services
        .object_store
        .upload(&key, &mut file, size, content_type)
        .context("uploading build artifact")?;

    let checksum_key = format!("{key}.sha256");
    let checksum_body = format!("{checksum}  {filename}\n");
    crate::store::local::upload_bytes(
        ctx.services.object_store.as_ref(),
        &checksum_key,
        checksum_body.as_bytes(),
        "text/plain",
    )
    .context("uploading checksum sidecar")?;

    ctx.artifact_path = Some(key);
    ctx.artifact_checksum = Some(checksum);
    ctx.artifact_size = Some(size);
    Ok(())
}

impl Stage for PackageStage {
    fn name(&self) -> StageName {
        StageName::Package
    }

    fn validate(&self, ctx: &StageContext) -> Result<()> {
        for rel in ["bin", "sbin", "etc/fstab", "boot/vmlinuz"] {
            if !ctx.paths.rootfs.join(rel).exists() {
                return Err(BuildError::ArtifactMissing(format!(
                    "package stage expects an assembled rootfs containing '{rel}'"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<()> {
        std::fs::create_dir_all(&ctx.paths.output)?;

        let image_path = match ctx.image_format {
            ImageFormat::Raw => build_raw_image(ctx, progress, 90)?,
            ImageFormat::Qcow2 => build_qcow2_image(ctx, progress)?,
            ImageFormat::Iso => build_iso_image(ctx, progress)?,
        };

        progress(95, "computing artifact checksum");
        upload_artifact(ctx, &image_path).context("uploading finished artifact")?;
        progress(100, "artifact uploaded");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grub_target_matches_arch() {
        assert_eq!(grub_target(TargetArch::X86_64), "x86_64-efi");
        assert_eq!(grub_target(TargetArch::Aarch64), "arm64-efi");
    }

    #[test]
    fn efi_stub_matches_arch() {
        assert_eq!(efi_stub_name(TargetArch::X86_64), "BOOTX64.EFI");
        assert_eq!(efi_stub_name(TargetArch::Aarch64), "BOOTAA64.EFI");
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = sha256_file(&path).unwrap();
        assert_eq!(digest, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn artifact_key_follows_canonical_layout() {
        let key = format!("distribution/{}/{}/builds/{}/{}", "acme", "distro", "build-1", "disk.img");
        assert_eq!(key, "distribution/acme/distro/builds/build-1/disk.img");
    }
}
