//! Object store trait shape. Canonical keys (spec §6):
//!
//! - kernel config: `distribution/<owner>/<dist>/kernel/.config`
//! - component sources: `distribution/<owner>/<dist>/(components|sources)/<source_id>/<version>/<file>`
//! - build artifact: `distribution/<owner>/<dist>/builds/<build_id>/<filename>`
//! - checksum sidecar: same key suffixed `.sha256`

use anyhow::Result;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

pub trait ObjectStore: Send + Sync {
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        size: u64,
        content_type: &str,
    ) -> Result<()>;

    fn download(&self, key: &str, dest: &Path) -> Result<ObjectMeta>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Optional capability: a backend whose objects already live on a local
    /// filesystem can expose their path directly, letting Resolve symlink
    /// the kernel config artifact instead of copying it (spec §4.5.1 step
    /// 5).
    fn resolve_local_path(&self, _key: &str) -> Option<std::path::PathBuf> {
        None
    }
}

/// Infer the `Content-Type` to upload an artifact with, from its filename
/// extension (spec §4.5.6).
pub fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or("") {
        "iso" => "application/x-iso9660-image",
        "qcow2" => "application/x-qemu-disk",
        "img" => "application/octet-stream",
        "sha256" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_inference() {
        assert_eq!(content_type_for("disk.iso"), "application/x-iso9660-image");
        assert_eq!(content_type_for("disk.qcow2"), "application/x-qemu-disk");
        assert_eq!(content_type_for("disk.img"), "application/octet-stream");
        assert_eq!(content_type_for("disk.img.sha256"), "text/plain");
    }
}
