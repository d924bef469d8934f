//! The master file: index header bytes plus the group catalog
//!
//! ```text
//! header length   u64
//! header          opaque bytes, kept byte-for-byte
//! next node id    u64, first id never handed out
//! per group:      group id u64, member count u64, member ids u64...
//! ```
//! Entries run to the end of the file.

use crate::codec::ByteReader;
use crate::model::BlockId;
use crate::{Error, Result};
use bytes::BufMut;
use std::collections::{BTreeMap, HashMap};

/// Which group holds each node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    header: Vec<u8>,
    next_node_id: u64,
    groups: BTreeMap<u64, Vec<BlockId>>,
    locations: HashMap<BlockId, u64>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index header bytes, empty until one is stored
    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    pub fn set_header_bytes(&mut self, header: Vec<u8>) {
        self.header = header;
    }

    /// Group holding `node`
    pub fn group_of(&self, node: BlockId) -> Option<u64> {
        self.locations.get(&node).copied()
    }

    pub fn members(&self, group: u64) -> Option<&[BlockId]> {
        self.groups.get(&group).map(Vec::as_slice)
    }

    pub fn group_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.groups.keys().copied()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn node_count(&self) -> usize {
        self.locations.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.locations.keys().copied()
    }

    /// Id for the next group
    pub fn next_group_id(&self) -> u64 {
        self.groups.keys().next_back().map_or(0, |last| last + 1)
    }

    /// Largest node id listed
    pub fn max_node_id(&self) -> Option<BlockId> {
        self.locations.keys().copied().max()
    }

    /// First node id not yet used by a header or a point file
    pub fn next_node_id(&self) -> u64 {
        let listed = self.max_node_id().map_or(0, |id| id.raw() + 1);
        self.next_node_id.max(listed)
    }

    pub fn set_next_node_id(&mut self, next: u64) {
        self.next_node_id = next;
    }

    /// Record a new group; nodes listed in older groups move to it
    pub fn insert_group(&mut self, group: u64, members: Vec<BlockId>) {
        for node in &members {
            if let Some(old) = self.locations.insert(*node, group) {
                if old == group {
                    continue;
                }
                if let Some(list) = self.groups.get_mut(&old) {
                    list.retain(|m| m != node);
                    if list.is_empty() {
                        self.groups.remove(&old);
                    }
                }
            }
        }
        self.groups.insert(group, members);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let entries: usize = self.groups.values().map(|m| 16 + m.len() * 8).sum();
        let mut out = Vec::with_capacity(16 + self.header.len() + entries);
        out.put_u64_le(self.header.len() as u64);
        out.put_slice(&self.header);
        out.put_u64_le(self.next_node_id);
        for (group, members) in &self.groups {
            out.put_u64_le(*group);
            out.put_u64_le(members.len() as u64);
            for node in members {
                out.put_u64_le(node.raw());
            }
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let header_len = r.count(1)?;
        let mut catalog = Catalog {
            header: r.take(header_len)?.to_vec(),
            next_node_id: r.u64()?,
            ..Default::default()
        };

        while !r.is_empty() {
            let group = r.u64()?;
            let count = r.count(8)?;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let node = r.id()?;
                if let Some(other) = catalog.locations.insert(node, group) {
                    return Err(Error::Corrupt(format!(
                        "Node {} listed in groups {} and {}",
                        node, other, group
                    )));
                }
                members.push(node);
            }
            if catalog.groups.insert(group, members).is_some() {
                return Err(Error::Corrupt(format!("Group {} listed twice", group)));
            }
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<BlockId> {
        raw.iter().copied().map(BlockId::new).collect()
    }

    #[test]
    fn test_master_layout_preserves_header() {
        let mut catalog = Catalog::new();
        catalog.set_header_bytes(vec![0xAB; 5]);
        catalog.insert_group(0, ids(&[1, 2]));
        catalog.insert_group(1, ids(&[3]));
        catalog.set_next_node_id(40);

        let bytes = catalog.to_bytes();
        assert_eq!(&bytes[0..8], &5u64.to_le_bytes());
        assert_eq!(&bytes[8..13], &[0xAB; 5]);
        assert_eq!(&bytes[13..21], &40u64.to_le_bytes());
        assert_eq!(bytes.len(), 21 + (16 + 16) + (16 + 8));

        let decoded = Catalog::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, catalog);
        assert_eq!(decoded.group_of(BlockId::new(3)), Some(1));
        assert_eq!(decoded.next_group_id(), 2);
        assert_eq!(decoded.next_node_id(), 40);
    }

    #[test]
    fn test_next_node_id_covers_listed_nodes() {
        let mut catalog = Catalog::new();
        assert_eq!(catalog.next_node_id(), 0);
        catalog.insert_group(0, ids(&[7]));
        assert_eq!(catalog.next_node_id(), 8);
        catalog.set_next_node_id(3);
        assert_eq!(catalog.next_node_id(), 8);
        catalog.set_next_node_id(12);
        assert_eq!(catalog.next_node_id(), 12);
    }

    #[test]
    fn test_rewritten_node_moves_to_new_group() {
        let mut catalog = Catalog::new();
        catalog.insert_group(0, ids(&[1, 2]));
        catalog.insert_group(1, ids(&[2, 3]));
        assert_eq!(catalog.group_of(BlockId::new(2)), Some(1));
        assert_eq!(catalog.members(0), Some(&ids(&[1])[..]));

        catalog.insert_group(2, ids(&[1]));
        assert_eq!(catalog.members(0), None);
        assert_eq!(catalog.group_count(), 2);
        assert_eq!(catalog.node_count(), 3);
    }

    #[test]
    fn test_duplicate_node_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.put_u64_le(0);
        bytes.put_u64_le(10);
        for group in [0u64, 1] {
            bytes.put_u64_le(group);
            bytes.put_u64_le(1);
            bytes.put_u64_le(9);
        }
        assert!(matches!(Catalog::from_bytes(&bytes), Err(Error::Corrupt(_))));
        assert!(matches!(
            Catalog::from_bytes(&bytes[..bytes.len() - 4]),
            Err(Error::Truncated { .. })
        ));
    }
}
