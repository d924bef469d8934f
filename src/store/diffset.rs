//! Incremental edit sets, one row per diffset
//!
//! Packed payload layout:
//! ```text
//! count        u64
//! per record:  u64 length, record bytes, zero padding to a 4-byte boundary
//! ```
//! Writes are batched: a commit happens every `diffset_batch_size` writes
//! and on [`DiffSetStore::save`].

use super::schema::{DIFFSETS, DIFFSET_STORE};
use super::tiles::{CommitPolicy, TileStore};
use super::versioned::{OpenMode, VersionedStore};
use crate::codec::ByteReader;
use crate::config::StoreOptions;
use crate::model::{BlockId, DiffSet};
use crate::store::BlockStore;
use crate::Result;
use bytes::BufMut;
use rusqlite::types::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const ALIGN: usize = 4;

fn padding(len: usize) -> usize {
    (ALIGN - len % ALIGN) % ALIGN
}

/// Pack edit records into the persisted layout
pub fn pack_records(records: &[Vec<u8>]) -> Vec<u8> {
    let body: usize = records.iter().map(|r| 8 + r.len() + padding(r.len())).sum();
    let mut out = Vec::with_capacity(8 + body);
    out.put_u64_le(records.len() as u64);
    for record in records {
        out.put_u64_le(record.len() as u64);
        out.put_slice(record);
        out.put_bytes(0, padding(record.len()));
    }
    out
}

pub fn unpack_records(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = ByteReader::new(raw);
    // Every record takes at least its length prefix
    let count = reader.count(8)?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.u64()? as usize;
        records.push(reader.take(len)?.to_vec());
        reader.take(padding(len))?;
    }
    Ok(records)
}

/// Element count of a packed payload, read from its prefix
pub(crate) fn packed_count(raw: &[u8]) -> Result<usize> {
    if raw.is_empty() {
        return Ok(0);
    }
    Ok(ByteReader::new(raw).u64()? as usize)
}

/// Store of [`DiffSet`]s in their own file
pub struct DiffSetStore {
    tiles: TileStore<u8>,
}

impl DiffSetStore {
    /// Wrap an open diffset file
    pub fn new(db: Arc<VersionedStore>, options: &StoreOptions) -> Self {
        let tiles = TileStore::new(db, DIFFSETS, options.payload_codec())
            .with_commit_policy(CommitPolicy::Batched(options.diffset_batch_size.max(1)));
        DiffSetStore { tiles }
    }

    pub fn open_or_create(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let db = VersionedStore::open_or_create(path, &DIFFSET_STORE, options.busy)?;
        Ok(Self::new(Arc::new(db), options))
    }

    pub fn open(path: impl AsRef<Path>, mode: OpenMode, options: &StoreOptions) -> Result<Self> {
        let db = VersionedStore::open(path, &DIFFSET_STORE, mode, options.busy)?;
        Ok(Self::new(Arc::new(db), options))
    }

    /// Persist a diffset; an unallocated id allocates a new one
    pub fn store_diffset(&self, diffset: &DiffSet) -> Result<BlockId> {
        let packed = pack_records(&diffset.records);
        let count = Value::Integer(diffset.count() as i64);
        self.tiles
            .store_with_columns(&packed, diffset.id, &[("count", count)])
    }

    /// The diffset stored under `id`, `None` when absent
    pub fn load_diffset(&self, id: BlockId) -> Result<Option<DiffSet>> {
        if !self.tiles.contains(id)? {
            return Ok(None);
        }
        let raw = self.tiles.load_bytes(id, usize::MAX)?;
        Ok(Some(DiffSet::new(id, unpack_records(&raw)?)))
    }

    /// Logical element count, zero when absent
    pub fn count(&self, id: BlockId) -> usize {
        match self.tiles.read_columns(id, "count", |row| row.get::<_, i64>(0)) {
            Ok(Some(count)) if count > 0 => count as usize,
            _ => 0,
        }
    }

    pub fn destroy(&self, id: BlockId) -> Result<bool> {
        self.tiles.destroy_block(id)
    }

    pub fn ids(&self) -> Result<Vec<BlockId>> {
        self.tiles.ids()
    }

    pub fn pending_writes(&self) -> usize {
        self.tiles.pending_writes()
    }

    /// Commit pending writes
    pub fn save(&self) -> Result<()> {
        let pending = self.tiles.pending_writes();
        self.tiles.flush()?;
        debug!(pending, "diffset_store.save");
        Ok(())
    }

    /// Commit pending writes and release the file
    pub fn close(&self) -> Result<()> {
        self.save()?;
        self.tiles.db().close()
    }

    pub fn db(&self) -> &Arc<VersionedStore> {
        self.tiles.db()
    }
}
