//! Node groups: many encoded node headers in one file
//!
//! File layout:
//! ```text
//! group id        u64
//! member count    u64
//! directory       count x (node id u64, offset u64, length u64)
//! data            concatenated header bytes, offsets relative to its start
//! ```

use crate::codec::ByteReader;
use crate::model::BlockId;
use crate::{Error, Result};
use bytes::BufMut;

const PREFIX_BYTES: usize = 16;
const ENTRY_BYTES: usize = 24;

/// Encoded node headers sharing one group file, in insertion order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGroup {
    id: u64,
    members: Vec<(BlockId, Vec<u8>)>,
    data_bytes: usize,
}

impl NodeGroup {
    pub fn new(id: u64) -> Self {
        NodeGroup {
            id,
            members: Vec::new(),
            data_bytes: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Size of the serialized group
    pub fn byte_size(&self) -> usize {
        PREFIX_BYTES + self.members.len() * ENTRY_BYTES + self.data_bytes
    }

    /// Size after adding a member of `len` bytes
    pub fn byte_size_with(&self, len: usize) -> usize {
        self.byte_size() + ENTRY_BYTES + len
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.members.iter().map(|(id, _)| *id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.members.iter().any(|(m, _)| *m == id)
    }

    pub fn get(&self, id: BlockId) -> Option<&[u8]> {
        self.members
            .iter()
            .find(|(m, _)| *m == id)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Add a member, replacing an earlier entry for the same node
    pub fn insert(&mut self, id: BlockId, bytes: Vec<u8>) {
        if let Some(entry) = self.members.iter_mut().find(|(m, _)| *m == id) {
            self.data_bytes = self.data_bytes - entry.1.len() + bytes.len();
            entry.1 = bytes;
        } else {
            self.data_bytes += bytes.len();
            self.members.push((id, bytes));
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size());
        out.put_u64_le(self.id);
        out.put_u64_le(self.members.len() as u64);
        let mut offset = 0u64;
        for (id, bytes) in &self.members {
            out.put_u64_le(id.raw());
            out.put_u64_le(offset);
            out.put_u64_le(bytes.len() as u64);
            offset += bytes.len() as u64;
        }
        for (_, bytes) in &self.members {
            out.put_slice(bytes);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let id = r.u64()?;
        let count = r.count(ENTRY_BYTES)?;
        let mut directory = Vec::with_capacity(count);
        for _ in 0..count {
            directory.push((r.id()?, r.u64()?, r.u64()?));
        }

        let data = &buf[r.position()..];
        let mut group = NodeGroup::new(id);
        for (node, offset, len) in directory {
            let end = offset.checked_add(len).filter(|end| *end <= data.len() as u64);
            let Some(end) = end else {
                return Err(Error::Truncated {
                    needed: r.position().saturating_add(offset.saturating_add(len) as usize),
                    available: buf.len(),
                });
            };
            if group.contains(node) {
                return Err(Error::Corrupt(format!(
                    "Node {} listed twice in group {}",
                    node, id
                )));
            }
            group.insert(node, data[offset as usize..end as usize].to_vec());
        }
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_layout() {
        let mut group = NodeGroup::new(7);
        group.insert(BlockId::new(1), vec![1, 2, 3]);
        group.insert(BlockId::new(4), vec![9; 5]);
        let bytes = group.to_bytes();

        assert_eq!(bytes.len(), group.byte_size());
        assert_eq!(bytes.len(), 16 + 2 * 24 + 8);
        assert_eq!(&bytes[0..8], &7u64.to_le_bytes());
        // Second directory entry: node 4 at offset 3, length 5
        assert_eq!(&bytes[40..48], &4u64.to_le_bytes());
        assert_eq!(&bytes[48..56], &3u64.to_le_bytes());
        assert_eq!(&bytes[56..64], &5u64.to_le_bytes());

        let decoded = NodeGroup::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, group);
        assert_eq!(decoded.get(BlockId::new(4)), Some(&[9u8; 5][..]));
    }

    #[test]
    fn test_replacing_member_keeps_size_exact() {
        let mut group = NodeGroup::new(0);
        group.insert(BlockId::new(1), vec![0; 10]);
        group.insert(BlockId::new(1), vec![0; 4]);
        assert_eq!(group.len(), 1);
        assert_eq!(group.byte_size(), group.to_bytes().len());
    }

    #[test]
    fn test_entry_past_end_is_truncated() {
        let mut group = NodeGroup::new(1);
        group.insert(BlockId::new(2), vec![5; 8]);
        let bytes = group.to_bytes();
        assert!(matches!(
            NodeGroup::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::Truncated { .. })
        ));
        assert!(matches!(
            NodeGroup::from_bytes(&bytes[..10]),
            Err(Error::Truncated { .. })
        ));
    }
}
