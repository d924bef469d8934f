//! Id-addressed storage of typed element arrays

use crate::codec::Element;
use crate::model::{BlockId, IndexHeader, NodeHeader};
use crate::{Error, Result};

/// CRUD contract shared by every tile store
///
/// A block is the array of elements attached to one id (one node's points,
/// one polygon, ...). Storing under [`BlockId::UNALLOCATED`] allocates a fresh
/// id that is never handed out again. Reads of an id that has no data yet
/// are not errors: counts are zero and loads are empty.
///
/// Stores that do not carry headers keep the default header methods.
pub trait BlockStore<T: Element>: Send + Sync {
    fn store_master_header(&self, _header: &IndexHeader) -> Result<()> {
        Err(Error::Unsupported("store has no master header".into()))
    }

    fn load_master_header(&self) -> Result<Option<IndexHeader>> {
        Ok(None)
    }

    fn store_node_header(&self, _header: &NodeHeader, _id: BlockId) -> Result<()> {
        Err(Error::Unsupported("store has no node headers".into()))
    }

    fn load_node_header(&self, _id: BlockId) -> Result<Option<NodeHeader>> {
        Ok(None)
    }

    /// Persist `elements` under `id` and return the id the block lives at
    fn store_block(&self, elements: &[T], id: BlockId) -> Result<BlockId>;

    /// Number of elements stored under `id`, zero when there are none
    fn get_block_data_count(&self, id: BlockId) -> usize;

    /// Up to `max_elements` elements stored under `id`
    fn load_block(&self, id: BlockId, max_elements: usize) -> Result<Vec<T>>;

    /// Fill `out` from the block and return the number of bytes produced
    fn load_block_into(&self, out: &mut [T], id: BlockId) -> Result<usize> {
        let loaded = self.load_block(id, out.len())?;
        out[..loaded.len()].copy_from_slice(&loaded);
        Ok(loaded.len() * T::SIZE)
    }

    /// Remove the block; `false` when nothing was removed or deletion is unsupported
    fn destroy_block(&self, _id: BlockId) -> Result<bool> {
        Ok(false)
    }
}
