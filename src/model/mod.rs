//! Core data model types for smstore

mod geometry;
mod header;
mod id;
mod records;
mod version;

pub use geometry::{Extent3d, Point2d, Point3d};
pub use header::{IndexHeader, NeighborLinks, NodeHeader, NEIGHBOR_DIRECTIONS};
pub use id::BlockId;
pub use records::{
    ClipKind, ClipRecord, CoverageRecord, DiffSet, Feature, GeometryType, SkirtRecord,
};
pub use version::SchemaVersion;
