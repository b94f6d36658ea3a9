//! The object store abstraction (spec §6): an opaque, content-addressable
//! blob store consumed through `Upload`/`Download`/`Exists`/`List`, with an
//! optional `LocalPathResolver` capability a backend can expose to let the
//! engine symlink instead of copy.

pub mod local;
pub mod traits;

pub use local::LocalObjectStore;
pub use traits::{ObjectMeta, ObjectStore};
