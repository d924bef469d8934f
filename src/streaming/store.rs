//! Grouped node-header and point store over a [`Transport`]

use super::catalog::Catalog;
use super::config::{GroupingConfig, StreamingConfig};
use super::group::NodeGroup;
use super::transport::{self, Transport};
use crate::codec::header::{decode_index_header, decode_node_header, encode_index_header, encode_node_header};
use crate::codec::{decode_elements, encode_elements, ByteReader, Element, ZstdCodec};
use crate::model::{BlockId, IndexHeader, NodeHeader, Point3d};
use crate::store::BlockStore;
use crate::{Error, Result};
use bytes::BufMut;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// The group being filled, with what the grouping rules need to know
struct OpenGroup {
    group: NodeGroup,
    min_level: u64,
    max_level: u64,
}

/// Buffered writes not yet sealed into a group file
struct WriteBuffer {
    open: Option<OpenGroup>,
    /// Parent links of every header written in this session
    parents: HashMap<BlockId, Option<BlockId>>,
    master_dirty: bool,
}

impl WriteBuffer {
    fn ancestors(&self, node: BlockId) -> Vec<BlockId> {
        let mut chain = vec![node];
        let mut at = node;
        while let Some(Some(parent)) = self.parents.get(&at) {
            // Guard against cycles in malformed input
            if chain.contains(parent) {
                break;
            }
            chain.push(*parent);
            at = *parent;
        }
        chain
    }

    /// Largest number of levels between any of `nodes` and their common ancestor
    fn ancestor_distance(&self, nodes: impl Iterator<Item = BlockId>) -> Option<u64> {
        let chains: Vec<Vec<BlockId>> = nodes.map(|n| self.ancestors(n)).collect();
        let first = chains.first()?;
        let common = first
            .iter()
            .find(|candidate| chains.iter().all(|c| c.contains(*candidate)))?;
        chains
            .iter()
            .map(|c| c.iter().position(|n| n == common).map(|p| p as u64))
            .try_fold(0u64, |max, d| d.map(|d| max.max(d)))
    }
}

/// Node headers batched into group files, points one file per node
///
/// Written headers accumulate in an open group until the next one would break
/// a [`GroupingConfig`] limit; the group is then written as one file and
/// listed in the catalog. The catalog and the index header are written to the
/// master file on [`save`](Self::save).
pub struct StreamingGroupStore {
    config: StreamingConfig,
    transport: Box<dyn Transport>,
    codec: ZstdCodec,
    catalog: RwLock<Catalog>,
    cache: Mutex<LruCache<u64, Arc<NodeGroup>>>,
    buffer: Mutex<WriteBuffer>,
    next_node_id: AtomicU64,
}

impl StreamingGroupStore {
    /// Open the store described by `config`, starting empty when no master exists
    pub fn open(config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport::connect(&config.transport)?;
        Self::with_transport(config, transport)
    }

    /// Open over an already-built transport
    pub fn with_transport(config: StreamingConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let catalog = match transport.read_master()? {
            Some(bytes) if !bytes.is_empty() => Catalog::from_bytes(&bytes)?,
            _ => Catalog::new(),
        };
        let next_node_id = catalog.next_node_id();
        let capacity = NonZeroUsize::new(config.cache_groups)
            .ok_or_else(|| Error::Config("cache_groups must be positive".into()))?;

        info!(
            location = %transport.describe(),
            groups = catalog.group_count(),
            nodes = catalog.node_count(),
            "streaming_store.open"
        );

        Ok(StreamingGroupStore {
            codec: ZstdCodec::new(config.compression_level),
            config,
            transport,
            catalog: RwLock::new(catalog),
            cache: Mutex::new(LruCache::new(capacity)),
            buffer: Mutex::new(WriteBuffer {
                open: None,
                parents: HashMap::new(),
                master_dirty: false,
            }),
            next_node_id: AtomicU64::new(next_node_id),
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn grouping(&self) -> &GroupingConfig {
        &self.config.grouping
    }

    /// Number of sealed groups
    pub fn group_count(&self) -> usize {
        self.catalog.read().group_count()
    }

    /// Members of a sealed group
    pub fn group_members(&self, group: u64) -> Option<Vec<BlockId>> {
        self.catalog.read().members(group).map(<[BlockId]>::to_vec)
    }

    /// Group holding `node`, `None` while it is still buffered or unknown
    pub fn group_of(&self, node: BlockId) -> Option<u64> {
        self.catalog.read().group_of(node)
    }

    /// Every node with a header, sealed or buffered, ascending
    pub fn node_ids(&self) -> Vec<BlockId> {
        let buffer = self.buffer.lock();
        let mut ids: Vec<BlockId> = self.catalog.read().node_ids().collect();
        if let Some(open) = &buffer.open {
            ids.extend(open.group.ids());
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Whether adding a header of `len` bytes at `level` keeps the open group in bounds
    fn fits(&self, buffer: &WriteBuffer, open: &OpenGroup, id: BlockId, len: usize, level: u64) -> bool {
        let rules = &self.config.grouping;
        if open.group.contains(id) {
            let current = open.group.get(id).map_or(0, <[u8]>::len);
            return open.group.byte_size() - current + len <= rules.max_group_bytes;
        }
        if open.group.len() + 1 > rules.max_members {
            return false;
        }
        if open.group.byte_size_with(len) > rules.max_group_bytes {
            return false;
        }
        let span = open.max_level.max(level) - open.min_level.min(level);
        if span > rules.max_depth_span {
            return false;
        }
        if let Some(limit) = rules.max_ancestor_distance {
            let members = open.group.ids().chain(std::iter::once(id));
            match buffer.ancestor_distance(members) {
                Some(distance) if distance <= limit => {}
                _ => return false,
            }
        }
        true
    }

    /// Write the open group and list it in the catalog
    fn seal(&self, buffer: &mut WriteBuffer) -> Result<()> {
        let Some(open) = buffer.open.take() else {
            return Ok(());
        };
        let bytes = open.group.to_bytes();
        if let Err(err) = self.transport.write_group(open.group.id(), &bytes) {
            warn!(group = open.group.id(), error = %err, "streaming_store.seal.failed");
            buffer.open = Some(open);
            return Err(err);
        }

        let members: Vec<BlockId> = open.group.ids().collect();
        debug!(
            group = open.group.id(),
            members = members.len(),
            bytes = bytes.len(),
            "streaming_store.seal"
        );
        self.catalog.write().insert_group(open.group.id(), members);
        self.cache.lock().put(open.group.id(), Arc::new(open.group));
        buffer.master_dirty = true;
        Ok(())
    }

    /// Seal the open group and write the master file
    pub fn save(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        self.seal(&mut buffer)?;
        {
            // Point files are not in the catalog, so their ids live in the counter
            let next = self.next_node_id.load(Ordering::SeqCst);
            let mut catalog = self.catalog.write();
            if catalog.next_node_id() < next {
                catalog.set_next_node_id(next);
                buffer.master_dirty = true;
            }
        }
        if buffer.master_dirty {
            let master = self.catalog.read().to_bytes();
            self.transport.write_master(&master)?;
            buffer.master_dirty = false;
            debug!(bytes = master.len(), "streaming_store.master.write");
        }
        Ok(())
    }

    fn load_group(&self, group: u64) -> Result<Arc<NodeGroup>> {
        if let Some(cached) = self.cache.lock().get(&group) {
            return Ok(cached.clone());
        }
        let bytes = self.transport.read_group(group)?;
        if bytes.is_empty() {
            return Err(Error::Transport(format!(
                "Group {} came back empty from {}",
                group,
                self.transport.describe()
            )));
        }
        let decoded = NodeGroup::from_bytes(&bytes)?;
        if decoded.id() != group {
            return Err(Error::Corrupt(format!(
                "File of group {} holds group {}",
                group,
                decoded.id()
            )));
        }
        trace!(group, members = decoded.len(), "streaming_store.group.fetch");
        let decoded = Arc::new(decoded);
        self.cache.lock().put(group, decoded.clone());
        Ok(decoded)
    }

    fn allocate_node_id(&self, id: BlockId) -> BlockId {
        if id.is_valid() {
            self.next_node_id.fetch_max(id.raw() + 1, Ordering::SeqCst);
            id
        } else {
            BlockId::new(self.next_node_id.fetch_add(1, Ordering::SeqCst))
        }
    }
}

impl BlockStore<Point3d> for StreamingGroupStore {
    fn store_master_header(&self, header: &IndexHeader) -> Result<()> {
        let mut buffer = self.buffer.lock();
        self.catalog
            .write()
            .set_header_bytes(encode_index_header(header));
        buffer.master_dirty = true;
        Ok(())
    }

    fn load_master_header(&self) -> Result<Option<IndexHeader>> {
        let catalog = self.catalog.read();
        if catalog.header_bytes().is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_index_header(catalog.header_bytes())?))
    }

    fn store_node_header(&self, header: &NodeHeader, id: BlockId) -> Result<()> {
        if !id.is_valid() {
            return Err(Error::Unsupported(
                "Node headers need an allocated node id".into(),
            ));
        }
        let bytes = encode_node_header(header)?;
        let mut buffer = self.buffer.lock();
        buffer.parents.insert(id, header.parent);
        self.allocate_node_id(id);

        let fits = match &buffer.open {
            Some(open) => self.fits(&buffer, open, id, bytes.len(), header.level),
            None => true,
        };
        if !fits {
            self.seal(&mut buffer)?;
        }

        let open = buffer.open.get_or_insert_with(|| OpenGroup {
            group: NodeGroup::new(self.catalog.read().next_group_id()),
            min_level: header.level,
            max_level: header.level,
        });
        open.min_level = open.min_level.min(header.level);
        open.max_level = open.max_level.max(header.level);
        open.group.insert(id, bytes);
        trace!(%id, group = open.group.id(), "streaming_store.header.buffer");
        Ok(())
    }

    fn load_node_header(&self, id: BlockId) -> Result<Option<NodeHeader>> {
        if !id.is_valid() {
            return Ok(None);
        }
        {
            let buffer = self.buffer.lock();
            if let Some(bytes) = buffer.open.as_ref().and_then(|o| o.group.get(id)) {
                return Ok(Some(decode_node_header(bytes)?));
            }
        }

        let group = self.catalog.read().group_of(id).ok_or_else(|| {
            Error::Corrupt(format!("Node {} is missing from the group catalog", id))
        })?;
        let loaded = self.load_group(group)?;
        let bytes = loaded.get(id).ok_or_else(|| {
            Error::Corrupt(format!("Group {} does not hold node {}", group, id))
        })?;
        Ok(Some(decode_node_header(bytes)?))
    }

    fn store_block(&self, elements: &[Point3d], id: BlockId) -> Result<BlockId> {
        let id = self.allocate_node_id(id);
        let raw = encode_elements(elements);
        let size = u32::try_from(raw.len()).map_err(|_| {
            Error::Unsupported(format!("{} points do not fit one point file", elements.len()))
        })?;

        let mut file = Vec::new();
        if size > 0 {
            let compressed = self.codec.compress(&raw)?;
            file.reserve(4 + compressed.len());
            file.put_u32_le(size);
            file.put_slice(&compressed);
        }
        self.transport.write_points(id, &file)?;
        trace!(%id, points = elements.len(), bytes = file.len(), "streaming_store.points.write");
        Ok(id)
    }

    fn get_block_data_count(&self, id: BlockId) -> usize {
        if !id.is_valid() {
            return 0;
        }
        match self.transport.read_points(id) {
            Ok(Some(file)) if file.len() >= 4 => match ByteReader::new(&file).u32() {
                Ok(size) => size as usize / Point3d::SIZE,
                Err(_) => 0,
            },
            Ok(_) => 0,
            Err(err) => {
                warn!(%id, error = %err, "streaming_store.points.count_failed");
                0
            }
        }
    }

    fn load_block(&self, id: BlockId, max_elements: usize) -> Result<Vec<Point3d>> {
        if !id.is_valid() {
            return Ok(Vec::new());
        }
        let Some(file) = self.transport.read_points(id)? else {
            return Ok(Vec::new());
        };
        if file.is_empty() {
            return Ok(Vec::new());
        }
        let mut reader = ByteReader::new(&file);
        let size = reader.u32()? as usize;
        let raw = self.codec.decompress(&file[4..], size)?;
        Ok(decode_elements(&raw, max_elements))
    }

    fn destroy_block(&self, id: BlockId) -> Result<bool> {
        if !id.is_valid() {
            return Ok(false);
        }
        self.transport.delete_points(id)
    }
}

impl Drop for StreamingGroupStore {
    fn drop(&mut self) {
        if let Err(err) = self.save() {
            warn!(error = %err, "streaming_store.drop.save_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Extent3d;
    use tempfile::tempdir;

    fn header(level: u64, parent: Option<u64>) -> NodeHeader {
        let mut header = NodeHeader::leaf(level, Extent3d::default());
        header.parent = parent.map(BlockId::new);
        header
    }

    fn store(root: &std::path::Path, grouping: GroupingConfig) -> StreamingGroupStore {
        StreamingGroupStore::open(StreamingConfig::file_system(root).with_grouping(grouping)).unwrap()
    }

    #[test]
    fn test_member_cap_splits_groups() {
        let dir = tempdir().unwrap();
        let grouping = GroupingConfig {
            max_members: 3,
            ..Default::default()
        };
        let store = store(dir.path(), grouping);

        for id in 0..3 {
            store.store_node_header(&header(1, None), BlockId::new(id)).unwrap();
        }
        store.save().unwrap();
        assert_eq!(store.group_count(), 1);

        store.store_node_header(&header(1, None), BlockId::new(3)).unwrap();
        store.save().unwrap();
        assert_eq!(store.group_count(), 2);
        assert_eq!(store.group_members(1), Some(vec![BlockId::new(3)]));
    }

    #[test]
    fn test_depth_span_splits_groups() {
        let dir = tempdir().unwrap();
        let grouping = GroupingConfig {
            max_depth_span: 1,
            ..Default::default()
        };
        let store = store(dir.path(), grouping);
        store.store_node_header(&header(0, None), BlockId::new(0)).unwrap();
        store.store_node_header(&header(1, Some(0)), BlockId::new(1)).unwrap();
        store.store_node_header(&header(2, Some(1)), BlockId::new(2)).unwrap();
        store.save().unwrap();

        assert_eq!(store.group_of(BlockId::new(1)), Some(0));
        assert_eq!(store.group_of(BlockId::new(2)), Some(1));
    }

    #[test]
    fn test_ancestor_distance_splits_groups() {
        let dir = tempdir().unwrap();
        let grouping = GroupingConfig {
            max_ancestor_distance: Some(1),
            max_depth_span: 10,
            ..Default::default()
        };
        let store = store(dir.path(), grouping);
        store.store_node_header(&header(0, None), BlockId::new(0)).unwrap();
        store.store_node_header(&header(1, Some(0)), BlockId::new(1)).unwrap();
        store.store_node_header(&header(1, Some(0)), BlockId::new(2)).unwrap();
        // Grandchild is two levels below the group's common ancestor
        store.store_node_header(&header(2, Some(1)), BlockId::new(3)).unwrap();
        store.save().unwrap();

        assert_eq!(store.group_members(0), Some(vec![BlockId::new(0), BlockId::new(1), BlockId::new(2)]));
        assert_eq!(store.group_of(BlockId::new(3)), Some(1));
    }

    #[test]
    fn test_headers_survive_reopen() {
        let dir = tempdir().unwrap();
        let master = IndexHeader {
            depth: 2,
            root_node_id: Some(BlockId::new(0)),
            ..Default::default()
        };
        {
            let store = store(dir.path(), GroupingConfig::default());
            store.store_master_header(&master).unwrap();
            store.store_node_header(&header(0, None), BlockId::new(0)).unwrap();
            store.store_node_header(&header(1, Some(0)), BlockId::new(1)).unwrap();
            // Still buffered, served from memory
            assert_eq!(store.load_node_header(BlockId::new(1)).unwrap(), Some(header(1, Some(0))));
        }

        let store = store(dir.path(), GroupingConfig::default());
        assert_eq!(store.load_master_header().unwrap(), Some(master));
        assert_eq!(store.load_node_header(BlockId::new(1)).unwrap(), Some(header(1, Some(0))));
        assert_eq!(store.node_ids(), vec![BlockId::new(0), BlockId::new(1)]);
        assert!(matches!(
            store.load_node_header(BlockId::new(5)),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_rewrite_moves_node_to_newest_group() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), GroupingConfig::default());
        store.store_node_header(&header(0, None), BlockId::new(0)).unwrap();
        store.store_node_header(&header(1, Some(0)), BlockId::new(1)).unwrap();
        store.save().unwrap();

        let mut updated = header(1, Some(0));
        updated.node_count = 42;
        store.store_node_header(&updated, BlockId::new(1)).unwrap();
        store.save().unwrap();

        assert_eq!(store.group_of(BlockId::new(1)), Some(1));
        assert_eq!(store.group_members(0), Some(vec![BlockId::new(0)]));
        assert_eq!(store.load_node_header(BlockId::new(1)).unwrap(), Some(updated));
    }

    #[test]
    fn test_point_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), GroupingConfig::default());
        let points = vec![Point3d::new(1.0, 2.0, 3.0), Point3d::new(4.0, 5.0, 6.0)];

        let id = store.store_block(&points, BlockId::UNALLOCATED).unwrap();
        assert_eq!(id, BlockId::new(0));
        assert_eq!(store.get_block_data_count(id), 2);
        assert_eq!(store.load_block(id, 10).unwrap(), points);

        let raw = std::fs::read(dir.path().join("points/0.bin")).unwrap();
        assert_eq!(&raw[0..4], &(2 * Point3d::SIZE as u32).to_le_bytes());

        store.store_block(&[], id).unwrap();
        assert_eq!(store.get_block_data_count(id), 0);
        assert!(store.load_block(id, 10).unwrap().is_empty());

        assert!(store.destroy_block(id).unwrap());
        assert_eq!(store.get_block_data_count(BlockId::new(8)), 0);
        assert!(store.load_block(BlockId::new(8), 10).unwrap().is_empty());
    }

    #[test]
    fn test_sentinel_header_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), GroupingConfig::default());
        assert!(matches!(
            store.store_node_header(&header(0, None), BlockId::UNALLOCATED),
            Err(Error::Unsupported(_))
        ));
    }
}
