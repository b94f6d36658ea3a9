//! Filesystem-backed reference `ObjectStore`, rooted at a base directory.
//! Exposes `LocalPathResolver`-style resolution trivially, since every
//! object already lives on the local disk.

use super::traits::{ObjectMeta, ObjectStore};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for LocalObjectStore {
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        _size: u64,
        _content_type: &str,
    ) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for '{}'", path.display()))?;
        }
        let mut file =
            File::create(&path).with_context(|| format!("creating object '{}'", path.display()))?;
        std::io::copy(reader, &mut file)
            .with_context(|| format!("writing object '{}'", path.display()))?;
        Ok(())
    }

    fn download(&self, key: &str, dest: &Path) -> Result<ObjectMeta> {
        let path = self.path_for(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&path, dest)
            .with_context(|| format!("downloading object '{}' to '{}'", key, dest.display()))?;
        let size = std::fs::metadata(dest)?.len();
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).exists())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let base = self.path_for(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .unwrap_or(entry.path());
                out.push(ObjectMeta {
                    key: rel.to_string_lossy().replace('\\', "/"),
                    size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                });
            }
        }
        Ok(out)
    }

    fn resolve_local_path(&self, key: &str) -> Option<PathBuf> {
        let path = self.path_for(key);
        path.exists().then_some(path)
    }
}

/// Convenience for callers that already have bytes in memory (checksum
/// sidecars, the kernel config artifact).
pub fn upload_bytes(store: &dyn ObjectStore, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
    let mut cursor = std::io::Cursor::new(bytes);
    store.upload(key, &mut cursor, bytes.len() as u64, content_type)
}

pub fn write_sidecar(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn upload_then_exists_and_download_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        upload_bytes(&store, "distribution/o/d/kernel/.config", b"hello", "text/plain").unwrap();
        assert!(store.exists("distribution/o/d/kernel/.config").unwrap());

        let dest = dir.path().join("out.config");
        let meta = store.download("distribution/o/d/kernel/.config", &dest).unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
    }

    #[test]
    fn missing_key_reports_not_exists() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(!store.exists("nope").unwrap());
    }

    #[test]
    fn resolve_local_path_points_at_the_real_file() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        upload_bytes(&store, "k", b"x", "text/plain").unwrap();

        let resolved = store.resolve_local_path("k").unwrap();
        assert!(resolved.exists());
    }
}
