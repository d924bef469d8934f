//! Clip, skirt and coverage polygons of one mesh
//!
//! The registry lives in its own store file next to the main index, created
//! on the first write; until then every lookup reports absence. Clip and
//! skirt insertions draw from one id sequence so a clip set can reference
//! either without ambiguity.
//!
//! The most recently written or read clip is held in a one-entry cache. The
//! cache lock is only held to inspect or replace the slot, never across file
//! I/O. Writes update the slot after they commit and bump a generation
//! counter; a read fills the slot only if no write landed while it was
//! loading, so a cached record is never older than the file.

use crate::config::StoreOptions;
use crate::model::{
    BlockId, ClipKind, ClipRecord, CoverageRecord, GeometryType, Point3d, SkirtRecord,
};
use crate::store::schema::{CLIP_DEFINITIONS, CLIP_POLYGONS, COVERAGE_POLYGONS, SKIRT_POLYGONS};
use crate::store::{BlockStore, OpenMode, TileStore, VersionedStore};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

const CLIP_COLUMNS: &str = "geometry_type, clip_kind, is_active, importance, dimension";

/// Cache counters since the registry was opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Classification columns of one clip row
#[derive(Clone, Copy, Debug, PartialEq)]
struct ClipColumns {
    geometry: GeometryType,
    kind: ClipKind,
    active: bool,
    importance: f64,
    dimension: i32,
}

impl ClipColumns {
    fn of(record: &ClipRecord) -> Self {
        ClipColumns {
            geometry: record.geometry,
            kind: record.kind,
            active: record.active,
            importance: record.importance,
            dimension: record.dimension,
        }
    }

    fn values(&self) -> [(&'static str, Value); 5] {
        [
            ("geometry_type", Value::Integer(self.geometry.as_code())),
            ("clip_kind", Value::Integer(self.kind.as_code())),
            ("is_active", Value::Integer(self.active as i64)),
            ("importance", Value::Real(self.importance)),
            ("dimension", Value::Integer(self.dimension as i64)),
        ]
    }
}

/// The open clip file and its id sequence
struct ClipStores {
    db: Arc<VersionedStore>,
    clips: TileStore<Point3d>,
    skirts: TileStore<Point3d>,
    coverages: TileStore<Point3d>,
    next_id: AtomicU64,
}

impl ClipStores {
    fn new(db: VersionedStore, options: &StoreOptions) -> Result<Self> {
        let db = Arc::new(db);
        let codec = options.payload_codec();
        let clips = TileStore::new(db.clone(), CLIP_POLYGONS, codec);
        let skirts = TileStore::new(db.clone(), SKIRT_POLYGONS, codec);
        let coverages = TileStore::new(db.clone(), COVERAGE_POLYGONS, codec);

        // Deleted ids stay retired, clip sets may still name them
        let last = [clips.last_allocated_id()?, skirts.last_allocated_id()?]
            .into_iter()
            .flatten()
            .map(|id| id.raw())
            .max();
        let next = last.map_or(1, |id| id + 1);

        Ok(ClipStores {
            db,
            clips,
            skirts,
            coverages,
            next_id: AtomicU64::new(next),
        })
    }

    fn allocate(&self) -> BlockId {
        BlockId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Keep the sequence ahead of ids chosen by the caller
    fn reserve(&self, id: BlockId) {
        self.next_id.fetch_max(id.raw() + 1, Ordering::SeqCst);
    }

    fn clip_columns(&self, id: BlockId) -> Result<Option<ClipColumns>> {
        let raw = self.clips.read_columns(id, CLIP_COLUMNS, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let Some((geometry, kind, active, importance, dimension)) = raw else {
            return Ok(None);
        };
        Ok(Some(ClipColumns {
            geometry: GeometryType::from_code(geometry)
                .ok_or_else(|| Error::Corrupt(format!("Clip {} has geometry type {}", id, geometry)))?,
            kind: ClipKind::from_code(kind)
                .ok_or_else(|| Error::Corrupt(format!("Clip {} has clip kind {}", id, kind)))?,
            active,
            importance,
            dimension: i32::try_from(dimension)
                .map_err(|_| Error::Corrupt(format!("Clip {} has dimension {}", id, dimension)))?,
        }))
    }

    fn load_clip(&self, id: BlockId) -> Result<Option<ClipRecord>> {
        let Some(columns) = self.clip_columns(id)? else {
            return Ok(None);
        };
        Ok(Some(ClipRecord {
            id,
            points: self.clips.load_block(id, usize::MAX)?,
            geometry: columns.geometry,
            kind: columns.kind,
            active: columns.active,
            importance: columns.importance,
            dimension: columns.dimension,
        }))
    }
}

/// Clip, skirt and coverage polygons with a single-slot clip cache
pub struct ClipRegistry {
    path: PathBuf,
    mode: OpenMode,
    options: StoreOptions,
    stores: Mutex<Option<Arc<ClipStores>>>,
    cache: Mutex<Option<Arc<ClipRecord>>>,
    /// Bumped under the cache lock by every clip write or delete
    generation: AtomicU64,
    /// Serializes clip writes so cache updates land in commit order
    writes: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ClipRegistry {
    /// Registry over the clip file at `path`, which need not exist yet
    pub fn new(path: impl AsRef<Path>, mode: OpenMode, options: StoreOptions) -> Self {
        ClipRegistry {
            path: path.as_ref().to_path_buf(),
            mode,
            options,
            stores: Mutex::new(None),
            cache: Mutex::new(None),
            generation: AtomicU64::new(0),
            writes: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the clip file has been created
    pub fn exists(&self) -> bool {
        self.stores.lock().is_some() || self.path.exists()
    }

    /// The open clip file, opening it when it exists and creating it when
    /// `create` is set
    fn stores(&self, create: bool) -> Result<Option<Arc<ClipStores>>> {
        let mut stores = self.stores.lock();
        if let Some(open) = stores.as_ref() {
            return Ok(Some(open.clone()));
        }

        let db = if self.path.exists() {
            VersionedStore::open(&self.path, &CLIP_DEFINITIONS, self.mode, self.options.busy)?
        } else if !create {
            return Ok(None);
        } else if self.mode == OpenMode::ReadOnly {
            return Err(Error::Unsupported(format!(
                "{} is open read-only",
                self.path.display()
            )));
        } else {
            let db = VersionedStore::create(&self.path, &CLIP_DEFINITIONS, self.options.busy)?;
            info!(path = %self.path.display(), "clip_registry.create");
            db
        };

        let open = Arc::new(ClipStores::new(db, &self.options)?);
        *stores = Some(open.clone());
        Ok(Some(open))
    }

    fn writable(&self) -> Result<Arc<ClipStores>> {
        self.stores(true)?
            .ok_or_else(|| Error::NotFound(format!("{}", self.path.display())))
    }

    fn cached(cache: &MutexGuard<'_, Option<Arc<ClipRecord>>>, id: BlockId) -> Option<Arc<ClipRecord>> {
        cache.as_ref().filter(|c| c.id == id).cloned()
    }

    /// Replace the cache slot after a committed write
    fn publish(&self, record: Option<Arc<ClipRecord>>) {
        let mut cache = self.cache.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *cache = record;
    }

    fn write_clip(&self, record: ClipRecord) -> Result<BlockId> {
        let stores = self.writable()?;
        let _writing = self.writes.lock();

        let mut record = record;
        if record.id.is_valid() {
            stores.reserve(record.id);
        } else {
            record.id = stores.allocate();
        }
        let columns = ClipColumns::of(&record).values();
        stores
            .clips
            .store_with_columns(&record.points, record.id, &columns)?;

        trace!(id = %record.id, points = record.points.len(), "clip_registry.clip.store");
        let id = record.id;
        self.publish(Some(Arc::new(record)));
        Ok(id)
    }

    /// Add an active mask clip and return its id
    pub fn add_clip(&self, points: &[Point3d]) -> Result<BlockId> {
        self.write_clip(ClipRecord::new(BlockId::UNALLOCATED, points.to_vec()))
    }

    pub fn add_clip_with_parameters(
        &self,
        points: &[Point3d],
        geometry: GeometryType,
        kind: ClipKind,
        active: bool,
    ) -> Result<BlockId> {
        let mut record = ClipRecord::new(BlockId::UNALLOCATED, points.to_vec());
        record.geometry = geometry;
        record.kind = kind;
        record.active = active;
        self.write_clip(record)
    }

    /// Replace the points of a clip, keeping its classification
    pub fn modify_clip(&self, id: BlockId, points: &[Point3d]) -> Result<()> {
        let columns = self.clip_columns(id)?;
        let mut record = ClipRecord::new(id, points.to_vec());
        if let Some(columns) = columns {
            record.geometry = columns.geometry;
            record.kind = columns.kind;
            record.active = columns.active;
            record.importance = columns.importance;
            record.dimension = columns.dimension;
        }
        self.write_clip(record).map(|_| ())
    }

    pub fn modify_clip_with_parameters(
        &self,
        id: BlockId,
        points: &[Point3d],
        geometry: GeometryType,
        kind: ClipKind,
        active: bool,
    ) -> Result<()> {
        let metadata = self.get_clip_metadata(id)?;
        let mut record = ClipRecord::new(id, points.to_vec());
        record.geometry = geometry;
        record.kind = kind;
        record.active = active;
        if let Some((importance, dimension)) = metadata {
            record.importance = importance;
            record.dimension = dimension;
        }
        self.write_clip(record).map(|_| ())
    }

    pub fn delete_clip(&self, id: BlockId) -> Result<bool> {
        let Some(stores) = self.stores(false)? else {
            return Ok(false);
        };
        let _writing = self.writes.lock();
        let removed = stores.clips.destroy_block(id)?;
        self.publish(None);
        debug!(%id, removed, "clip_registry.clip.delete");
        Ok(removed)
    }

    /// Points of a clip, `None` when absent
    pub fn get_clip(&self, id: BlockId) -> Result<Option<Vec<Point3d>>> {
        Ok(self.get_clip_with_parameters(id)?.map(|r| r.points))
    }

    /// A clip and its classification, `None` when absent
    pub fn get_clip_with_parameters(&self, id: BlockId) -> Result<Option<ClipRecord>> {
        if !id.is_valid() {
            return Ok(None);
        }
        if let Some(record) = Self::cached(&self.cache.lock(), id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some((*record).clone()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let generation = self.generation.load(Ordering::SeqCst);
        let Some(stores) = self.stores(false)? else {
            return Ok(None);
        };
        let record = stores.load_clip(id)?;
        if let Some(record) = &record {
            let mut cache = self.cache.lock();
            if self.generation.load(Ordering::SeqCst) == generation {
                *cache = Some(Arc::new(record.clone()));
            }
        }
        Ok(record)
    }

    pub fn has_clip(&self, id: BlockId) -> Result<bool> {
        match self.stores(false)? {
            Some(stores) => stores.clips.contains(id),
            None => Ok(false),
        }
    }

    pub fn has_skirt(&self, id: BlockId) -> Result<bool> {
        match self.stores(false)? {
            Some(stores) => stores.skirts.contains(id),
            None => Ok(false),
        }
    }

    pub fn has_coverage(&self, id: BlockId) -> Result<bool> {
        match self.stores(false)? {
            Some(stores) => stores.coverages.contains(id),
            None => Ok(false),
        }
    }

    pub fn get_all_clip_ids(&self) -> Result<Vec<BlockId>> {
        match self.stores(false)? {
            Some(stores) => stores.clips.ids(),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_all_coverage_ids(&self) -> Result<Vec<BlockId>> {
        match self.stores(false)? {
            Some(stores) => stores.coverages.ids(),
            None => Ok(Vec::new()),
        }
    }

    /// Update a single column of a clip, refreshing the cached copy
    fn update_clip_columns(
        &self,
        id: BlockId,
        assignments: &[(&str, Value)],
        refresh: impl FnOnce(&mut ClipRecord),
    ) -> Result<bool> {
        let Some(stores) = self.stores(false)? else {
            return Ok(false);
        };
        let _writing = self.writes.lock();
        let changed = stores.clips.update_columns(id, assignments)?;
        if changed {
            let mut cache = self.cache.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Some(record) = Self::cached(&cache, id) {
                let mut record = (*record).clone();
                refresh(&mut record);
                *cache = Some(Arc::new(record));
            }
        }
        Ok(changed)
    }

    /// Toggle a clip; `false` when the clip does not exist
    pub fn set_clip_on_or_off(&self, id: BlockId, active: bool) -> Result<bool> {
        self.update_clip_columns(
            id,
            &[("is_active", Value::Integer(active as i64))],
            |record| record.active = active,
        )
    }

    pub fn get_is_clip_active(&self, id: BlockId) -> Result<Option<bool>> {
        Ok(self.clip_columns(id)?.map(|c| c.active))
    }

    pub fn get_clip_type(&self, id: BlockId) -> Result<Option<ClipKind>> {
        Ok(self.clip_columns(id)?.map(|c| c.kind))
    }

    pub fn get_clip_geometry(&self, id: BlockId) -> Result<Option<GeometryType>> {
        Ok(self.clip_columns(id)?.map(|c| c.geometry))
    }

    pub fn set_clip_metadata(&self, id: BlockId, importance: f64, dimension: i32) -> Result<bool> {
        self.update_clip_columns(
            id,
            &[
                ("importance", Value::Real(importance)),
                ("dimension", Value::Integer(dimension as i64)),
            ],
            |record| {
                record.importance = importance;
                record.dimension = dimension;
            },
        )
    }

    /// Importance and dimensionality of a clip
    pub fn get_clip_metadata(&self, id: BlockId) -> Result<Option<(f64, i32)>> {
        Ok(self
            .clip_columns(id)?
            .map(|c| (c.importance, c.dimension)))
    }

    /// Classification of a clip without loading its points
    fn clip_columns(&self, id: BlockId) -> Result<Option<ClipColumns>> {
        if let Some(record) = Self::cached(&self.cache.lock(), id) {
            return Ok(Some(ClipColumns::of(&record)));
        }
        match self.stores(false)? {
            Some(stores) => stores.clip_columns(id),
            None => Ok(None),
        }
    }

    /// Add skirt polylines under a fresh id from the clip sequence
    pub fn add_skirts(&self, polylines: &[Vec<Point3d>]) -> Result<BlockId> {
        let stores = self.writable()?;
        let id = stores.allocate();
        let skirt = SkirtRecord::from_polylines(id, polylines);
        stores.skirts.store_block(&skirt.points, id)?;
        trace!(%id, polylines = polylines.len(), "clip_registry.skirt.store");
        Ok(id)
    }

    pub fn modify_skirt(&self, id: BlockId, polylines: &[Vec<Point3d>]) -> Result<()> {
        if !id.is_valid() {
            return Err(Error::Unsupported("Skirts are modified by id".into()));
        }
        let stores = self.writable()?;
        stores.reserve(id);
        let skirt = SkirtRecord::from_polylines(id, polylines);
        stores.skirts.store_block(&skirt.points, id)?;
        Ok(())
    }

    pub fn get_skirt(&self, id: BlockId) -> Result<Option<SkirtRecord>> {
        let Some(stores) = self.stores(false)? else {
            return Ok(None);
        };
        if !stores.skirts.contains(id)? {
            return Ok(None);
        }
        Ok(Some(SkirtRecord {
            id,
            points: stores.skirts.load_block(id, usize::MAX)?,
        }))
    }

    pub fn delete_skirt(&self, id: BlockId) -> Result<bool> {
        match self.stores(false)? {
            Some(stores) => stores.skirts.destroy_block(id),
            None => Ok(false),
        }
    }

    /// Insert or replace a coverage and its name; an unallocated id allocates one.
    /// The polygon and the name are committed together or not at all.
    pub fn modify_coverage(&self, id: BlockId, points: &[Point3d], name: &str) -> Result<BlockId> {
        let stores = self.writable()?;
        let id = stores
            .coverages
            .store_with(points, id, &[], |conn, id| {
                conn.execute(
                    "INSERT OR REPLACE INTO coverage_names (polygon_id, name) VALUES (?1, ?2)",
                    params![id.as_sql(), name],
                )?;
                Ok(())
            })?;
        trace!(%id, name, "clip_registry.coverage.store");
        Ok(id)
    }

    pub fn get_coverage(&self, id: BlockId) -> Result<Option<CoverageRecord>> {
        let Some(stores) = self.stores(false)? else {
            return Ok(None);
        };
        if !stores.coverages.contains(id)? {
            return Ok(None);
        }
        let points = stores.coverages.load_block(id, usize::MAX)?;
        let name = Self::coverage_name(&stores, id)?.unwrap_or_default();
        Ok(Some(CoverageRecord { id, points, name }))
    }

    pub fn get_coverage_name(&self, id: BlockId) -> Result<Option<String>> {
        match self.stores(false)? {
            Some(stores) => Self::coverage_name(&stores, id),
            None => Ok(None),
        }
    }

    fn coverage_name(stores: &ClipStores, id: BlockId) -> Result<Option<String>> {
        stores.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT name FROM coverage_names WHERE polygon_id = ?1",
                    [id.as_sql()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn delete_coverage(&self, id: BlockId) -> Result<bool> {
        let Some(stores) = self.stores(false)? else {
            return Ok(false);
        };
        let removed = stores.coverages.destroy_block(id)?;
        stores.db.with_write(|conn| {
            conn.execute(
                "DELETE FROM coverage_names WHERE polygon_id = ?1",
                [id.as_sql()],
            )?;
            Ok(())
        })?;
        Ok(removed)
    }

    /// Cache hit and miss counts of clip lookups
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Flush the clip file, if it was ever opened
    pub fn save(&self) -> Result<()> {
        match self.stores.lock().as_ref() {
            Some(stores) => stores.db.save(),
            None => Ok(()),
        }
    }

    /// Close the clip file; a later access reopens it
    pub fn close(&self) -> Result<()> {
        let _writing = self.writes.lock();
        self.publish(None);
        if let Some(stores) = self.stores.lock().take() {
            stores.db.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn square(offset: f64) -> Vec<Point3d> {
        vec![
            Point3d::new(offset, offset, 0.0),
            Point3d::new(offset + 1.0, offset, 0.0),
            Point3d::new(offset + 1.0, offset + 1.0, 0.0),
            Point3d::new(offset, offset + 1.0, 0.0),
        ]
    }

    fn registry(dir: &Path) -> ClipRegistry {
        ClipRegistry::new(
            dir.join("mesh.clips.db"),
            OpenMode::ReadWrite,
            StoreOptions::default(),
        )
    }

    #[test]
    fn test_reads_do_not_create_file() {
        let dir = tempdir().unwrap();
        let clips = registry(dir.path());
        assert!(!clips.has_clip(BlockId::new(1)).unwrap());
        assert!(clips.get_clip(BlockId::new(1)).unwrap().is_none());
        assert!(clips.get_all_clip_ids().unwrap().is_empty());
        assert!(!clips.delete_clip(BlockId::new(1)).unwrap());
        assert!(!clips.exists());

        clips.add_clip(&square(0.0)).unwrap();
        assert!(clips.exists());
    }

    #[test]
    fn test_write_then_read_hits_cache() {
        let dir = tempdir().unwrap();
        let clips = registry(dir.path());

        let id = clips.add_clip(&square(0.0)).unwrap();
        assert_eq!(clips.get_clip(id).unwrap(), Some(square(0.0)));
        assert_eq!(clips.stats(), CacheStats { hits: 1, misses: 0 });

        let other = clips.add_clip(&square(5.0)).unwrap();
        assert_eq!(clips.get_clip(id).unwrap(), Some(square(0.0)));
        assert_eq!(clips.stats().misses, 1);
        assert_eq!(clips.get_clip(other).unwrap(), Some(square(5.0)));
    }

    #[test]
    fn test_delete_clears_cache() {
        let dir = tempdir().unwrap();
        let clips = registry(dir.path());
        let id = clips.add_clip(&square(0.0)).unwrap();

        assert!(clips.delete_clip(id).unwrap());
        assert!(clips.get_clip(id).unwrap().is_none());
        assert!(!clips.has_clip(id).unwrap());
    }

    #[test]
    fn test_flags_and_metadata() {
        let dir = tempdir().unwrap();
        let clips = registry(dir.path());
        let id = clips
            .add_clip_with_parameters(&square(0.0), GeometryType::Prism, ClipKind::Boundary, true)
            .unwrap();

        assert!(clips.set_clip_on_or_off(id, false).unwrap());
        assert_eq!(clips.get_is_clip_active(id).unwrap(), Some(false));
        assert_eq!(clips.get_clip_type(id).unwrap(), Some(ClipKind::Boundary));
        assert_eq!(clips.get_clip_geometry(id).unwrap(), Some(GeometryType::Prism));

        assert!(clips.set_clip_metadata(id, 2.5, 3).unwrap());
        clips.modify_clip(id, &square(1.0)).unwrap();
        let record = clips.get_clip_with_parameters(id).unwrap().unwrap();
        assert_eq!(record.points, square(1.0));
        assert!(!record.active);
        assert_eq!(record.kind, ClipKind::Boundary);
        assert_eq!((record.importance, record.dimension), (2.5, 3));

        assert!(!clips.set_clip_on_or_off(BlockId::new(99), true).unwrap());
        assert_eq!(clips.get_is_clip_active(BlockId::new(99)).unwrap(), None);
    }

    #[test]
    fn test_clips_and_skirts_share_ids() {
        let dir = tempdir().unwrap();
        let clips = registry(dir.path());
        let clip = clips.add_clip(&square(0.0)).unwrap();
        let skirt = clips.add_skirts(&[square(1.0), square(2.0)]).unwrap();
        let next = clips.add_clip(&square(3.0)).unwrap();

        assert_eq!(clip, BlockId::new(1));
        assert_eq!(skirt, BlockId::new(2));
        assert_eq!(next, BlockId::new(3));
        assert!(clips.has_skirt(skirt).unwrap());
        assert!(!clips.has_clip(skirt).unwrap());
        assert_eq!(
            clips.get_skirt(skirt).unwrap().unwrap().polylines(),
            vec![square(1.0), square(2.0)]
        );
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let clips = registry(dir.path());
            clips.add_clip(&square(0.0)).unwrap();
            clips.add_skirts(&[square(1.0)]).unwrap();
            clips.close().unwrap();
        }
        let clips = registry(dir.path());
        assert_eq!(clips.add_clip(&square(2.0)).unwrap(), BlockId::new(3));
    }

    #[test]
    fn test_deleted_ids_stay_retired_after_reopen() {
        let dir = tempdir().unwrap();
        let deleted = {
            let clips = registry(dir.path());
            clips.add_clip(&square(0.0)).unwrap();
            let last = clips.add_clip(&square(1.0)).unwrap();
            assert!(clips.delete_clip(last).unwrap());
            clips.close().unwrap();
            last
        };
        let clips = registry(dir.path());
        let fresh = clips.add_clip(&square(2.0)).unwrap();
        assert_eq!(deleted, BlockId::new(2));
        assert_eq!(fresh, BlockId::new(3));

        let skirt = clips.add_skirts(&[square(3.0)]).unwrap();
        assert!(clips.delete_skirt(skirt).unwrap());
        clips.close().unwrap();
        assert_eq!(clips.add_clip(&square(4.0)).unwrap(), BlockId::new(5));
    }

    #[test]
    fn test_coverage_name_failure_rolls_back_polygon() {
        let dir = tempdir().unwrap();
        let first = {
            let clips = registry(dir.path());
            let first = clips
                .modify_coverage(BlockId::UNALLOCATED, &square(0.0), "pit")
                .unwrap();
            clips.close().unwrap();
            first
        };
        {
            let conn = rusqlite::Connection::open(dir.path().join("mesh.clips.db")).unwrap();
            conn.execute_batch("DROP TABLE coverage_names").unwrap();
        }

        let clips = registry(dir.path());
        assert!(clips
            .modify_coverage(BlockId::UNALLOCATED, &square(1.0), "dump")
            .is_err());
        assert!(clips.modify_coverage(first, &square(2.0), "pit").is_err());
        assert_eq!(clips.get_all_coverage_ids().unwrap(), vec![first]);

        {
            let conn = rusqlite::Connection::open(dir.path().join("mesh.clips.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE coverage_names (polygon_id INTEGER PRIMARY KEY, name TEXT NOT NULL DEFAULT '')",
            )
            .unwrap();
        }
        let coverage = clips.get_coverage(first).unwrap().unwrap();
        assert_eq!(coverage.points, square(0.0));
        assert_eq!(coverage.name, "");
    }

    #[test]
    fn test_coverages() {
        let dir = tempdir().unwrap();
        let clips = registry(dir.path());
        let id = clips
            .modify_coverage(BlockId::UNALLOCATED, &square(0.0), "quarry")
            .unwrap();

        assert!(clips.has_coverage(id).unwrap());
        assert_eq!(clips.get_coverage_name(id).unwrap().as_deref(), Some("quarry"));
        let coverage = clips.get_coverage(id).unwrap().unwrap();
        assert_eq!(coverage.points, square(0.0));
        assert_eq!(clips.get_all_coverage_ids().unwrap(), vec![id]);

        assert!(clips.delete_coverage(id).unwrap());
        assert!(clips.get_coverage_name(id).unwrap().is_none());
    }

    #[test]
    fn test_read_only_refuses_creation() {
        let dir = tempdir().unwrap();
        let clips = ClipRegistry::new(
            dir.path().join("mesh.clips.db"),
            OpenMode::ReadOnly,
            StoreOptions::default(),
        );
        assert!(matches!(
            clips.add_clip(&square(0.0)),
            Err(Error::Unsupported(_))
        ));
    }
}
