//! Linear feature sets (breaklines, boundaries, ...)

use super::schema::{FEATURES, FEATURE_STORE};
use super::tiles::TileStore;
use super::versioned::{OpenMode, VersionedStore};
use crate::config::StoreOptions;
use crate::model::{BlockId, Feature};
use crate::store::BlockStore;
use crate::Result;
use rusqlite::types::Value;
use std::path::Path;
use std::sync::Arc;

/// One row per feature set, serialized with bincode
pub struct FeatureStore {
    tiles: TileStore<u8>,
}

impl FeatureStore {
    pub fn new(db: Arc<VersionedStore>, options: &StoreOptions) -> Self {
        FeatureStore {
            tiles: TileStore::new(db, FEATURES, options.payload_codec()),
        }
    }

    pub fn open_or_create(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let db = VersionedStore::open_or_create(path, &FEATURE_STORE, options.busy)?;
        Ok(Self::new(Arc::new(db), options))
    }

    pub fn open(path: impl AsRef<Path>, mode: OpenMode, options: &StoreOptions) -> Result<Self> {
        let db = VersionedStore::open(path, &FEATURE_STORE, mode, options.busy)?;
        Ok(Self::new(Arc::new(db), options))
    }

    /// Persist a feature set under `id`; an unallocated id allocates a new one
    pub fn store_features(&self, features: &[Feature], id: BlockId) -> Result<BlockId> {
        let payload = bincode::serialize(features)?;
        let kind = match features.split_first() {
            Some((first, rest)) if rest.iter().all(|f| f.kind == first.kind) => {
                Value::Integer(first.kind as i64)
            }
            _ => Value::Null,
        };
        self.tiles
            .store_with_columns(&payload, id, &[("feature_type", kind)])
    }

    /// The feature set under `id`, empty when absent
    pub fn load_features(&self, id: BlockId) -> Result<Vec<Feature>> {
        let raw = self.tiles.load_bytes(id, usize::MAX)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(bincode::deserialize(&raw)?)
    }

    /// Feature kind shared by the whole set, `None` when mixed, empty or absent
    pub fn feature_type(&self, id: BlockId) -> Result<Option<u32>> {
        let kind = self
            .tiles
            .read_columns(id, "feature_type", |row| row.get::<_, Option<i64>>(0))?;
        Ok(kind.flatten().map(|k| k as u32))
    }

    pub fn destroy(&self, id: BlockId) -> Result<bool> {
        self.tiles.destroy_block(id)
    }

    pub fn ids(&self) -> Result<Vec<BlockId>> {
        self.tiles.ids()
    }

    pub fn close(&self) -> Result<()> {
        self.tiles.db().close()
    }
}
