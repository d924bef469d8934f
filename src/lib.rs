//! # smstore
//!
//! Versioned, compressed, file-backed tile storage for out-of-core scalable
//! meshes.
//!
//! A mesh is a spatial tree of nodes. Each node has a header (extent, level,
//! links to parent, children and neighbours, ids of its data blocks) and data
//! blocks: points, face indices, texture coordinates, textures and graphs.
//! smstore persists both, alongside clip polygons and per-node edit sets.
//!
//! ## Core Concepts
//!
//! - **Versioned stores**: SQLite files carrying a schema version, upgraded
//!   in place by a chain of migrations
//! - **Block stores**: typed element arrays addressed by [`BlockId`], stored
//!   compressed with their raw size
//! - **Clip registry**: clip, skirt and coverage polygons with a single-entry
//!   read cache
//! - **Streaming store**: node headers packed into group files and points in
//!   per-node files, served from disk or over HTTP
//!
//! ## Example
//!
//! ```ignore
//! use smstore::{BlockId, BlockStore, MeshIndexStore, Point3d, StoreOptions};
//!
//! let index = MeshIndexStore::open_or_create("site.smdb", StoreOptions::default())?;
//! let id = index.points().store_block(&[Point3d::new(0.0, 0.0, 0.0)], BlockId::UNALLOCATED)?;
//! assert_eq!(index.points().get_block_data_count(id), 1);
//! index.save()?;
//! ```

pub mod clip;
pub mod codec;
pub mod config;
pub mod model;
pub mod store;
pub mod streaming;

mod error;

pub use clip::{CacheStats, ClipRegistry};
pub use config::{BusyPolicy, StoreOptions};
pub use error::{Error, Result};
pub use model::{
    BlockId, ClipKind, ClipRecord, CoverageRecord, DiffSet, Extent3d, Feature, GeometryType,
    IndexHeader, NeighborLinks, NodeHeader, Point2d, Point3d, SchemaVersion, SkirtRecord,
};
pub use store::{
    BlockStore, CommitPolicy, DiffSetStore, FeatureStore, MeshIndexStore, OpenMode, TileStore,
    VersionedStore,
};
pub use streaming::{StreamingConfig, StreamingGroupStore, TransportConfig};
