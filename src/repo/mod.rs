//! Repository traits: the engine's view of the relational store (spec §6).
//! Only `BuildJobRepository` and `DistributionRepository` are written to;
//! the rest are read-only external collaborators.

pub mod memory;
pub mod traits;

pub use traits::{
    BoardProfileRepository, BuildJobRepository, ComponentRepository, DistributionRepository,
    DownloadJobRepository, SourceRepository,
};
