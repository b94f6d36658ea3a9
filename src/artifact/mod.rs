//! Artifact builders used by the Assemble and Package stages.
//!
//! - [`cpio`] - cpio archives for the initramfs
//! - [`disk`] - loop device / mount RAII helpers for the `raw`/`qcow2` formats
//! - [`filesystem`] - directory copying, initramfs structure creation
//! - [`iso_utils`] - ISO creation utilities (xorriso, checksums, EFI boot images)
//! - [`squashfs`] - compressed filesystem images for the `iso` format

pub mod cpio;
pub mod disk;
pub mod filesystem;
pub mod iso_utils;
pub mod squashfs;
