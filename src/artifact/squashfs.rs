//! Squashfs image builder: a thin wrapper around `mksquashfs`, used by the
//! `iso` image format (spec §4.5.6: `mksquashfs` the rootfs with
//! `xz/x86/1M`).

use crate::process::Cmd;
use anyhow::Result;
use std::path::Path;

/// Options for building a squashfs image.
#[derive(Debug, Clone)]
pub struct SquashfsOptions<'a> {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    pub compression: &'a str,

    /// Block size (e.g., "128K", "256K", "512K", "1M").
    pub block_size: &'a str,

    /// Whether to include extended attributes.
    pub xattrs: bool,
}

impl Default for SquashfsOptions<'_> {
    fn default() -> Self {
        Self {
            compression: "xz",
            block_size: "1M",
            xattrs: false,
        }
    }
}

/// Build a squashfs image from a directory.
///
/// # Example
///
/// ```rust,ignore
/// use ldf_engine::artifact::squashfs::{build_squashfs, SquashfsOptions};
/// use std::path::Path;
///
/// let options = SquashfsOptions::default();
/// build_squashfs(Path::new("staging/"), Path::new("output/filesystem.squashfs"), &options)?;
/// ```
pub fn build_squashfs(source_dir: &Path, output: &Path, options: &SquashfsOptions) -> Result<()> {
    if output.exists() {
        std::fs::remove_file(output)?;
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut cmd = Cmd::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(output)
        .args(["-comp", options.compression])
        .args(["-b", options.block_size]);

    if !options.xattrs {
        cmd = cmd.arg("-no-xattrs");
    }

    cmd.error_msg("mksquashfs failed. Install squashfs-tools.")
        .run()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_iso_format_spec() {
        let options = SquashfsOptions::default();
        assert_eq!(options.compression, "xz");
        assert_eq!(options.block_size, "1M");
        assert!(!options.xattrs);
    }
}
