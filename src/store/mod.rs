//! Versioned, file-backed tile stores
//!
//! Every store file is a SQLite database with a schema version and
//! migrations ([`VersionedStore`]). Tile payloads are compressed blobs
//! addressed by [`BlockId`](crate::model::BlockId) and accessed through the
//! [`BlockStore`] trait.

mod block;
pub mod diffset;
mod feature;
pub mod headers;
mod index;
pub mod schema;
mod tiles;
mod versioned;

pub use block::BlockStore;
pub use diffset::DiffSetStore;
pub use feature::FeatureStore;
pub use index::{sidecar_path, MeshIndexStore};
pub use schema::BlobTable;
pub use tiles::{CommitPolicy, TextureInfo, TileStore};
pub use versioned::{Migration, OpenMode, StoreDescriptor, VersionedStore};
