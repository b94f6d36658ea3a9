//! Disk image building primitives used by the `package` stage.
//!
//! The original sudo-free, mtools-spliced assembly this module's
//! predecessor used is replaced by the approach spec'd for the package
//! stage: a GPT table via `sfdisk`, a loop device with partition
//! scanning, `mkfs`, a real mount, `rsync`, and a bootloader install run
//! under `chroot`. These helpers provide the small, independently
//! testable pieces; the orchestration lives in [`crate::stages::package`].

pub mod helpers;
pub mod mtools;

pub use helpers::{generate_disk_uuids, DiskUuids};

use anyhow::Context;
use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// A loop device attached with partition scanning (`losetup -P`), detached
/// on drop so a panicking stage never leaks a loop device.
pub struct LoopDevice {
    pub device: PathBuf,
    detached: bool,
}

impl LoopDevice {
    /// Attach `image` as a loop device with partition table scanning.
    pub fn attach(image: &Path) -> Result<Self> {
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(image)
            .error_msg("losetup failed to attach image")
            .run()?;
        let device = PathBuf::from(result.stdout.trim());
        if device.as_os_str().is_empty() {
            anyhow::bail!("losetup did not report a device path");
        }
        Ok(LoopDevice {
            device,
            detached: false,
        })
    }

    /// Path to partition `n` (1-indexed) of the attached device, e.g.
    /// `/dev/loop0p1`.
    pub fn partition(&self, n: u32) -> PathBuf {
        PathBuf::from(format!("{}p{}", self.device.display(), n))
    }

    pub fn detach(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        Cmd::new("losetup")
            .args(["-d"])
            .arg_path(&self.device)
            .error_msg("losetup -d failed to detach loop device")
            .run()?;
        self.detached = true;
        Ok(())
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

/// A filesystem mounted at `mountpoint`, unmounted on drop.
pub struct Mount {
    pub mountpoint: PathBuf,
    mounted: bool,
}

impl Mount {
    pub fn mount(device: &Path, mountpoint: &Path) -> Result<Self> {
        std::fs::create_dir_all(mountpoint)
            .with_context(|| format!("creating mountpoint '{}'", mountpoint.display()))?;
        Cmd::new("mount")
            .arg_path(device)
            .arg_path(mountpoint)
            .error_msg(format!("mount failed for '{}'", device.display()))
            .run()?;
        Ok(Mount {
            mountpoint: mountpoint.to_path_buf(),
            mounted: true,
        })
    }

    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        Cmd::new("umount")
            .arg_path(&self.mountpoint)
            .error_msg(format!("umount failed for '{}'", self.mountpoint.display()))
            .run()?;
        self.mounted = false;
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        let _ = self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_device_partition_path_is_numbered() {
        let dev = LoopDevice {
            device: PathBuf::from("/dev/loop7"),
            detached: true,
        };
        assert_eq!(dev.partition(1), PathBuf::from("/dev/loop7p1"));
        assert_eq!(dev.partition(2), PathBuf::from("/dev/loop7p2"));
    }
}
