//! Block identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a stored block (one node's points, one polygon, ...)
///
/// Links between tiles are persisted as numeric ids rather than pointers, so
/// that a tree can be reloaded independently of any in-memory session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// The unallocated sentinel. Never addresses data; storing under it
    /// allocates a fresh id.
    pub const UNALLOCATED: BlockId = BlockId(u64::MAX);

    /// Create an id from its raw value
    pub const fn new(raw: u64) -> Self {
        BlockId(raw)
    }

    /// Get the raw value (the sentinel included)
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Check that this id may address data
    pub const fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }

    /// `None` for the sentinel
    pub fn get(&self) -> Option<u64> {
        self.is_valid().then_some(self.0)
    }

    /// Row key used by the relational stores
    pub(crate) fn as_sql(&self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(raw: i64) -> Self {
        BlockId(raw as u64)
    }

    /// Encode an optional link, absent links becoming the sentinel
    pub fn from_option(id: Option<BlockId>) -> Self {
        id.unwrap_or(BlockId::UNALLOCATED)
    }

    /// Decode a persisted link, the sentinel becoming `None`
    pub fn to_option(self) -> Option<BlockId> {
        self.is_valid().then_some(self)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<unallocated>")
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

impl Default for BlockId {
    fn default() -> Self {
        BlockId::UNALLOCATED
    }
}

impl From<u64> for BlockId {
    fn from(raw: u64) -> Self {
        BlockId(raw)
    }
}
