//! Archive extraction hardened against path traversal (spec §4.5.3, §9:
//! "must be unit-tested; do not rely on the OS to reject the write").
//!
//! The teacher already depends on `tar`; gzip/bzip2/xz decoders are added
//! here via `flate2`/`bzip2`/`xz2` (grounded in the retrieval pack's own
//! distro-building crates, see SPEC_FULL.md §0).

use crate::error::BuildError;
use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Component as PathComponent, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

/// Infer compression from a filename suffix (spec §4.5.3).
pub fn infer_compression(filename: &str) -> Compression {
    if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        Compression::Gzip
    } else if filename.ends_with(".tar.bz2") || filename.ends_with(".tbz2") {
        Compression::Bzip2
    } else if filename.ends_with(".tar.xz") || filename.ends_with(".txz") {
        Compression::Xz
    } else {
        Compression::None
    }
}

/// Clean a path the way Go's `filepath.Clean` / the spec's "cleaned
/// destination path" does: resolve `.`/`..` components lexically without
/// touching the filesystem, dropping any leading `..` that would escape.
fn clean_join(dest_root: &Path, entry_path: &Path) -> PathBuf {
    let mut cleaned = dest_root.to_path_buf();
    for part in entry_path.components() {
        match part {
            PathComponent::Normal(seg) => cleaned.push(seg),
            PathComponent::ParentDir => {
                cleaned.pop();
            }
            PathComponent::CurDir | PathComponent::RootDir | PathComponent::Prefix(_) => {}
        }
    }
    cleaned
}

/// The path-traversal guard itself: true iff `candidate` is `dest_root` or
/// a descendant of it (spec §8: "the cleaned absolute destination path
/// starts with the cleaned destination root plus the platform separator").
pub fn is_within(dest_root: &Path, candidate: &Path) -> bool {
    if candidate == dest_root {
        return true;
    }
    candidate.starts_with(dest_root)
        && candidate
            .strip_prefix(dest_root)
            .map(|rest| !rest.as_os_str().is_empty())
            .unwrap_or(false)
}

fn decode_reader<'a>(
    file: fs::File,
    compression: Compression,
) -> Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
    })
}

/// Stream a (possibly compressed) tar archive into `dest_root`, rejecting
/// any entry whose cleaned target path escapes it.
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn extract(archive_path: &Path, dest_root: &Path) -> Result<()> {
        let filename = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let compression = infer_compression(&filename);

        fs::create_dir_all(dest_root)
            .with_context(|| format!("creating extraction root '{}'", dest_root.display()))?;
        let dest_root = dest_root
            .canonicalize()
            .with_context(|| format!("canonicalizing '{}'", dest_root.display()))?;

        let file = fs::File::open(archive_path)
            .with_context(|| format!("opening archive '{}'", archive_path.display()))?;
        let reader = decode_reader(file, compression)?;
        let mut archive = tar::Archive::new(reader);

        for entry in archive
            .entries()
            .context("reading tar entries")?
        {
            let mut entry = entry.context("reading tar entry header")?;
            let entry_path = entry
                .path()
                .context("reading tar entry path")?
                .into_owned();

            let target = clean_join(&dest_root, &entry_path);
            if !is_within(&dest_root, &target) {
                return Err(BuildError::ArchiveTraversal(format!(
                    "entry '{}' escapes destination root",
                    entry_path.display()
                ))
                .into());
            }

            let header = entry.header().clone();
            match header.entry_type() {
                tar::EntryType::Directory => {
                    fs::create_dir_all(&target)
                        .with_context(|| format!("creating dir '{}'", target.display()))?;
                }
                tar::EntryType::Symlink => {
                    let link_target = entry
                        .link_name()
                        .context("reading symlink target")?
                        .context("symlink entry missing link target")?
                        .into_owned();
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let _ = fs::remove_file(&target);
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&link_target, &target)
                        .with_context(|| format!("creating symlink '{}'", target.display()))?;
                }
                tar::EntryType::Link => {
                    let link_target_entry = entry
                        .link_name()
                        .context("reading hard link target")?
                        .context("hard link entry missing link target")?
                        .into_owned();
                    let hardlink_target = clean_join(&dest_root, &link_target_entry);
                    if !is_within(&dest_root, &hardlink_target) {
                        return Err(BuildError::ArchiveTraversal(format!(
                            "hard link '{}' escapes destination root",
                            link_target_entry.display()
                        ))
                        .into());
                    }
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let _ = fs::remove_file(&target);
                    fs::hard_link(&hardlink_target, &target)
                        .with_context(|| format!("creating hard link '{}'", target.display()))?;
                }
                _ => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    entry
                        .unpack(&target)
                        .with_context(|| format!("writing '{}'", target.display()))?;
                }
            }
        }

        Ok(())
    }

    /// After extraction, if exactly one top-level directory exists it
    /// becomes `local_path`; otherwise the extract root itself is used
    /// (spec §4.5.3).
    pub fn resolve_local_path(dest_root: &Path) -> Result<PathBuf> {
        let mut top_level_dirs = Vec::new();
        for entry in fs::read_dir(dest_root)
            .with_context(|| format!("reading '{}'", dest_root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                top_level_dirs.push(entry.path());
            }
        }

        if top_level_dirs.len() == 1 {
            Ok(top_level_dirs.into_iter().next().unwrap())
        } else {
            Ok(dest_root.to_path_buf())
        }
    }
}
