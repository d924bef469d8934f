//! Generic compressed-blob tile store
//!
//! Every attachment table has the same shape: an integer id, the compressed
//! payload and its uncompressed length. Some tables add typed columns
//! (clip classification, diffset counts); those are written alongside the
//! payload in the same statement.

use super::block::BlockStore;
use super::headers;
use super::schema::BlobTable;
use super::versioned::VersionedStore;
use crate::codec::{decode_elements, encode_elements, texture_side, Element, PayloadCodec};
use crate::model::{BlockId, IndexHeader, NodeHeader};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// When writes become durable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit after every write
    EveryWrite,
    /// Commit once this many writes are pending, or on flush
    Batched(usize),
}

/// Derived dimensions of a stored texture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// A [`BlockStore`] over one blob table of a [`VersionedStore`]
pub struct TileStore<T: Element> {
    db: Arc<VersionedStore>,
    table: BlobTable,
    codec: PayloadCodec,
    commit: CommitPolicy,
    pending: Mutex<usize>,
    headers: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element> TileStore<T> {
    pub fn new(db: Arc<VersionedStore>, table: BlobTable, codec: PayloadCodec) -> Self {
        TileStore {
            db,
            table,
            codec,
            commit: CommitPolicy::EveryWrite,
            pending: Mutex::new(0),
            headers: false,
            _marker: PhantomData,
        }
    }

    pub fn with_commit_policy(mut self, commit: CommitPolicy) -> Self {
        self.commit = commit;
        self
    }

    /// Also serve the master and node headers of the underlying file
    pub fn with_headers(mut self) -> Self {
        self.headers = true;
        self
    }

    pub fn table(&self) -> BlobTable {
        self.table
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    pub fn db(&self) -> &Arc<VersionedStore> {
        &self.db
    }

    /// Writes not yet committed under a batched policy
    pub fn pending_writes(&self) -> usize {
        *self.pending.lock()
    }

    /// Commit pending batched writes
    pub fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        self.db.commit_batch()?;
        *pending = 0;
        Ok(())
    }

    /// Compress and upsert `elements` together with extra typed columns
    pub(crate) fn store_with_columns(
        &self,
        elements: &[T],
        id: BlockId,
        extra: &[(&str, Value)],
    ) -> Result<BlockId> {
        self.store_with(elements, id, extra, |_, _| Ok(()))
    }

    /// Like [`store_with_columns`](Self::store_with_columns), running `then`
    /// on the stored id inside the same savepoint; an error from `then`
    /// rolls back the payload too
    pub(crate) fn store_with(
        &self,
        elements: &[T],
        id: BlockId,
        extra: &[(&str, Value)],
        then: impl FnOnce(&Connection, BlockId) -> Result<()>,
    ) -> Result<BlockId> {
        let raw = encode_elements(elements);
        let data = self.codec.compress(&raw)?;

        if let CommitPolicy::Batched(_) = self.commit {
            self.db.begin_batch()?;
        }
        let stored = self.db.with_write(|conn| {
            let stored = self.upsert(conn, id, data, raw.len(), extra)?;
            then(conn, stored)?;
            Ok(stored)
        })?;
        self.after_write()?;

        trace!(
            table = self.table.table,
            id = %stored,
            elements = elements.len(),
            "tile_store.store"
        );
        Ok(stored)
    }

    fn upsert(
        &self,
        conn: &Connection,
        id: BlockId,
        data: Vec<u8>,
        size: usize,
        extra: &[(&str, Value)],
    ) -> Result<BlockId> {
        let BlobTable { table, id_column } = self.table;
        let mut columns = vec!["data", "size"];
        let mut values = vec![Value::Blob(data), Value::Integer(size as i64)];
        for (column, value) in extra {
            columns.push(*column);
            values.push(value.clone());
        }

        if !id.is_valid() {
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    placeholders
                ),
                params_from_iter(values),
            )?;
            let allocated = BlockId::from_sql(conn.last_insert_rowid());
            debug!(table, id = %allocated, "tile_store.allocate");
            return Ok(allocated);
        }

        if row_exists(conn, self.table, id)? {
            let assignments = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", c, i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            values.push(Value::Integer(id.as_sql()));
            conn.execute(
                &format!(
                    "UPDATE {} SET {} WHERE {} = ?{}",
                    table,
                    assignments,
                    id_column,
                    values.len()
                ),
                params_from_iter(values),
            )?;
        } else {
            columns.push(id_column);
            values.push(Value::Integer(id.as_sql()));
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    placeholders
                ),
                params_from_iter(values),
            )?;
        }
        Ok(id)
    }

    fn after_write(&self) -> Result<()> {
        match self.commit {
            CommitPolicy::EveryWrite => Ok(()),
            CommitPolicy::Batched(limit) => {
                let mut pending = self.pending.lock();
                *pending += 1;
                if *pending >= limit {
                    // Counter only resets once the commit went through
                    self.db.commit_batch()?;
                    trace!(table = self.table.table, writes = *pending, "tile_store.batch.flush");
                    *pending = 0;
                }
                Ok(())
            }
        }
    }

    /// Decompressed payload bytes, at most `max_bytes` of them
    pub(crate) fn load_bytes(&self, id: BlockId, max_bytes: usize) -> Result<Vec<u8>> {
        if !id.is_valid() {
            return Ok(Vec::new());
        }
        let BlobTable { table, id_column } = self.table;
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT data, size FROM {} WHERE {} = ?1", table, id_column),
                    [id.as_sql()],
                    |row| Ok((row.get::<_, Option<Vec<u8>>>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?)
        })?;

        let Some((data, size)) = row else {
            return Ok(Vec::new());
        };
        if size < 0 {
            return Err(Error::Corrupt(format!(
                "{} {} declares {} bytes",
                table, id, size
            )));
        }
        let mut raw = self
            .codec
            .decompress(&data.unwrap_or_default(), size as usize)?;
        raw.truncate(max_bytes);
        Ok(raw)
    }

    /// Read extra columns of one row, `None` when the row is absent
    pub(crate) fn read_columns<R>(
        &self,
        id: BlockId,
        columns: &str,
        map: impl FnOnce(&Row<'_>) -> rusqlite::Result<R>,
    ) -> Result<Option<R>> {
        if !id.is_valid() {
            return Ok(None);
        }
        let BlobTable { table, id_column } = self.table;
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM {} WHERE {} = ?1", columns, table, id_column),
                    [id.as_sql()],
                    map,
                )
                .optional()?)
        })
    }

    /// Update extra columns of one row without touching its payload
    pub(crate) fn update_columns(&self, id: BlockId, assignments: &[(&str, Value)]) -> Result<bool> {
        if !id.is_valid() || assignments.is_empty() {
            return Ok(false);
        }
        let BlobTable { table, id_column } = self.table;
        let set = assignments
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", c, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values: Vec<Value> = assignments.iter().map(|(_, v)| v.clone()).collect();
        values.push(Value::Integer(id.as_sql()));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            table,
            set,
            id_column,
            values.len()
        );

        if let CommitPolicy::Batched(_) = self.commit {
            self.db.begin_batch()?;
        }
        let changed = self
            .db
            .with_write(|conn| Ok(conn.execute(&sql, params_from_iter(values))?))?;
        self.after_write()?;
        Ok(changed > 0)
    }

    /// Ids of every stored block, ascending
    pub fn ids(&self) -> Result<Vec<BlockId>> {
        let BlobTable { table, id_column } = self.table;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} ORDER BY {}",
                id_column, table, id_column
            ))?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(BlockId::from_sql(row?));
            }
            Ok(ids)
        })
    }

    pub fn contains(&self, id: BlockId) -> Result<bool> {
        if !id.is_valid() {
            return Ok(false);
        }
        self.db.with_conn(|conn| row_exists(conn, self.table, id))
    }

    /// Largest stored id
    pub fn max_id(&self) -> Result<Option<BlockId>> {
        let BlobTable { table, id_column } = self.table;
        self.db.with_conn(|conn| {
            let max: Option<i64> = conn.query_row(
                &format!("SELECT MAX({}) FROM {}", id_column, table),
                [],
                |row| row.get(0),
            )?;
            Ok(max.map(BlockId::from_sql))
        })
    }

    /// Largest id the table has ever held, deleted rows included
    pub fn last_allocated_id(&self) -> Result<Option<BlockId>> {
        let BlobTable { table, id_column } = self.table;
        self.db.with_conn(|conn| {
            let live: Option<i64> = conn.query_row(
                &format!("SELECT MAX({}) FROM {}", id_column, table),
                [],
                |row| row.get(0),
            )?;
            // AUTOINCREMENT keeps the high-water mark in sqlite_sequence
            let tracked: Option<i64> = if has_sequence(conn)? {
                conn.query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .optional()?
            } else {
                None
            };
            Ok(live.max(tracked).map(BlockId::from_sql))
        })
    }
}

impl TileStore<u8> {
    /// Dimensions of a stored texture, derived from its uncompressed length
    pub fn texture_info(&self, id: BlockId) -> Result<Option<TextureInfo>> {
        let channels = match self.codec {
            PayloadCodec::Jpeg(codec) => codec.channels,
            PayloadCodec::Zstd(_) => {
                return Err(Error::Unsupported(format!(
                    "{} does not hold textures",
                    self.table.table
                )))
            }
        };
        let size = self.read_columns(id, "size", |row| row.get::<_, i64>(0))?;
        match size {
            Some(size) if size > 0 => {
                let side = texture_side(size as usize, channels as usize)?;
                Ok(Some(TextureInfo {
                    width: side,
                    height: side,
                    channels,
                }))
            }
            _ => Ok(None),
        }
    }
}

fn has_sequence(conn: &Connection) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn row_exists(conn: &Connection, table: BlobTable, id: BlockId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE {} = ?1",
                table.table, table.id_column
            ),
            [id.as_sql()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

impl<T: Element> BlockStore<T> for TileStore<T> {
    fn store_master_header(&self, header: &IndexHeader) -> Result<()> {
        if !self.headers {
            return Err(Error::Unsupported(format!(
                "{} has no master header",
                self.table.table
            )));
        }
        self.db
            .with_write(|conn| headers::store_master_header(conn, header))
    }

    fn load_master_header(&self) -> Result<Option<IndexHeader>> {
        if !self.headers {
            return Ok(None);
        }
        self.db.with_conn(headers::load_master_header)
    }

    fn store_node_header(&self, header: &NodeHeader, id: BlockId) -> Result<()> {
        if !self.headers {
            return Err(Error::Unsupported(format!(
                "{} has no node headers",
                self.table.table
            )));
        }
        self.db
            .with_write(|conn| headers::store_node_header(conn, id, header))
    }

    fn load_node_header(&self, id: BlockId) -> Result<Option<NodeHeader>> {
        if !self.headers {
            return Ok(None);
        }
        self.db
            .with_conn(|conn| headers::load_node_header(conn, id))
    }

    fn store_block(&self, elements: &[T], id: BlockId) -> Result<BlockId> {
        self.store_with_columns(elements, id, &[])
    }

    fn get_block_data_count(&self, id: BlockId) -> usize {
        match self.read_columns(id, "size", |row| row.get::<_, i64>(0)) {
            Ok(Some(size)) if size > 0 => size as usize / T::SIZE,
            Ok(_) => 0,
            Err(err) => {
                warn!(table = self.table.table, %id, error = %err, "tile_store.count.failed");
                0
            }
        }
    }

    fn load_block(&self, id: BlockId, max_elements: usize) -> Result<Vec<T>> {
        let raw = self.load_bytes(id, max_elements.saturating_mul(T::SIZE))?;
        Ok(decode_elements(&raw, max_elements))
    }

    fn destroy_block(&self, id: BlockId) -> Result<bool> {
        if !id.is_valid() {
            return Ok(false);
        }
        let BlobTable { table, id_column } = self.table;
        if let CommitPolicy::Batched(_) = self.commit {
            self.db.begin_batch()?;
        }
        let removed = self.db.with_write(|conn| {
            Ok(conn.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", table, id_column),
                [id.as_sql()],
            )?)
        })?;
        self.after_write()?;
        debug!(table, %id, removed, "tile_store.destroy");
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JpegCodec, ZstdCodec};
    use crate::config::BusyPolicy;
    use crate::model::{Point2d, Point3d};
    use crate::store::schema::{MAIN_INDEX, POINTS, TEXTURES, UVS};
    use tempfile::tempdir;

    fn main_index(dir: &std::path::Path) -> Arc<VersionedStore> {
        Arc::new(
            VersionedStore::create(dir.join("mesh.db"), &MAIN_INDEX, BusyPolicy::default()).unwrap(),
        )
    }

    fn zstd() -> PayloadCodec {
        PayloadCodec::Zstd(ZstdCodec::default())
    }

    #[test]
    fn test_points_lifecycle() {
        let dir = tempdir().unwrap();
        let points: TileStore<Point3d> = TileStore::new(main_index(dir.path()), POINTS, zstd());

        let id = points
            .store_block(
                &[Point3d::new(1.0, 2.0, 3.0), Point3d::new(4.0, 5.0, 6.0)],
                BlockId::UNALLOCATED,
            )
            .unwrap();
        assert_eq!(id, BlockId::new(1));
        assert_eq!(points.get_block_data_count(id), 2);

        let again = points
            .store_block(&[Point3d::new(7.0, 8.0, 9.0)], id)
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(points.get_block_data_count(id), 1);
        assert_eq!(
            points.load_block(id, 10).unwrap(),
            vec![Point3d::new(7.0, 8.0, 9.0)]
        );

        assert!(points.destroy_block(id).unwrap());
        assert_eq!(points.get_block_data_count(id), 0);
        assert!(points.load_block(id, 10).unwrap().is_empty());
        assert!(!points.destroy_block(id).unwrap());
    }

    #[test]
    fn test_allocated_ids_are_not_reused() {
        let dir = tempdir().unwrap();
        let uvs: TileStore<Point2d> = TileStore::new(main_index(dir.path()), UVS, zstd());

        let first = uvs.store_block(&[Point2d::new(0.5, 0.5)], BlockId::UNALLOCATED).unwrap();
        uvs.destroy_block(first).unwrap();
        let second = uvs.store_block(&[Point2d::new(0.1, 0.9)], BlockId::UNALLOCATED).unwrap();
        assert_ne!(first, second);

        // Storing at an explicit id keeps that id
        let explicit = uvs.store_block(&[Point2d::default()], BlockId::new(40)).unwrap();
        assert_eq!(explicit, BlockId::new(40));
        assert_eq!(uvs.max_id().unwrap(), Some(BlockId::new(40)));
        assert_eq!(uvs.ids().unwrap(), vec![second, explicit]);

        uvs.destroy_block(explicit).unwrap();
        assert_eq!(uvs.max_id().unwrap(), Some(second));
        assert_eq!(uvs.last_allocated_id().unwrap(), Some(explicit));
    }

    #[test]
    fn test_failed_hook_rolls_back_payload() {
        let dir = tempdir().unwrap();
        let points: TileStore<Point3d> = TileStore::new(main_index(dir.path()), POINTS, zstd());

        let result = points.store_with(&[Point3d::default()], BlockId::new(4), &[], |conn, id| {
            conn.execute("INSERT INTO no_such_table VALUES (?1)", [id.as_sql()])?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!points.contains(BlockId::new(4)).unwrap());

        let stored = points
            .store_with(&[Point3d::default()], BlockId::new(4), &[], |_, id| {
                assert_eq!(id, BlockId::new(4));
                Ok(())
            })
            .unwrap();
        assert!(points.contains(stored).unwrap());
    }

    #[test]
    fn test_load_respects_capacity() {
        let dir = tempdir().unwrap();
        let points: TileStore<Point3d> = TileStore::new(main_index(dir.path()), POINTS, zstd());
        let data: Vec<Point3d> = (0..5).map(|i| Point3d::new(i as f64, 0.0, 0.0)).collect();
        let id = points.store_block(&data, BlockId::new(3)).unwrap();

        assert_eq!(points.load_block(id, 2).unwrap(), data[..2].to_vec());

        let mut out = [Point3d::default(); 8];
        let bytes = points.load_block_into(&mut out, id).unwrap();
        assert_eq!(bytes, 5 * 24);
        assert_eq!(&out[..5], &data[..]);
    }

    #[test]
    fn test_batched_commits() {
        let dir = tempdir().unwrap();
        let points: TileStore<Point3d> = TileStore::new(main_index(dir.path()), POINTS, zstd())
            .with_commit_policy(CommitPolicy::Batched(3));

        for i in 0..2 {
            points
                .store_block(&[Point3d::default()], BlockId::new(i))
                .unwrap();
        }
        assert_eq!(points.pending_writes(), 2);
        assert!(points.db().in_batch());

        points.store_block(&[Point3d::default()], BlockId::new(2)).unwrap();
        assert_eq!(points.pending_writes(), 0);
        assert!(!points.db().in_batch());

        points.store_block(&[Point3d::default()], BlockId::new(3)).unwrap();
        points.flush().unwrap();
        assert_eq!(points.pending_writes(), 0);
        assert_eq!(points.ids().unwrap().len(), 4);
    }

    #[test]
    fn test_texture_dimensions() {
        let dir = tempdir().unwrap();
        let textures: TileStore<u8> = TileStore::new(
            main_index(dir.path()),
            TEXTURES,
            PayloadCodec::Jpeg(JpegCodec::new(90, 3)),
        );
        let raw = vec![128u8; 16 * 16 * 3];
        let id = textures.store_block(&raw, BlockId::new(5)).unwrap();

        assert_eq!(
            textures.texture_info(id).unwrap(),
            Some(TextureInfo {
                width: 16,
                height: 16,
                channels: 3
            })
        );
        assert_eq!(textures.get_block_data_count(id), raw.len());
        assert_eq!(textures.load_block(id, usize::MAX).unwrap().len(), raw.len());
        assert!(textures.texture_info(BlockId::new(6)).unwrap().is_none());
    }

    #[test]
    fn test_headers_only_when_enabled() {
        let dir = tempdir().unwrap();
        let db = main_index(dir.path());
        let plain: TileStore<Point3d> = TileStore::new(db.clone(), POINTS, zstd());
        assert!(matches!(
            plain.store_node_header(&NodeHeader::default(), BlockId::new(1)),
            Err(Error::Unsupported(_))
        ));
        assert!(plain.load_master_header().unwrap().is_none());

        let with_headers: TileStore<Point3d> = TileStore::new(db, POINTS, zstd()).with_headers();
        with_headers
            .store_node_header(&NodeHeader::default(), BlockId::new(1))
            .unwrap();
        assert_eq!(
            with_headers.load_node_header(BlockId::new(1)).unwrap(),
            Some(NodeHeader::default())
        );
    }
}
