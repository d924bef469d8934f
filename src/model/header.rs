//! Node and index header metadata

use super::{BlockId, Extent3d};
use serde::{Deserialize, Serialize};

/// Number of neighbor directions around a node (3x3x3 minus the node itself)
pub const NEIGHBOR_DIRECTIONS: usize = 26;

/// Neighbors of a node in one direction
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborLinks {
    /// Ids of the neighbor nodes
    pub ids: Vec<BlockId>,
    /// Whether the node's mesh is stitched to these neighbors
    pub stitched: bool,
}

/// Per-tile metadata describing one node of the spatial tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeHeader {
    /// Maximum number of points before the node splits
    pub split_threshold: u64,
    pub is_leaf: bool,
    /// Children are split sub-nodes (as opposed to a single unsplit child)
    pub is_branched: bool,
    pub filtered: bool,
    pub node_extent: Extent3d,
    /// Extent of the actual content, when computed
    pub content_extent: Option<Extent3d>,
    pub level: u64,
    /// Points in this node and its descendants, when computed
    pub total_count: Option<u64>,
    /// Points stored directly in this node
    pub node_count: u64,
    pub are_points_3d: bool,
    pub is_textured: bool,
    pub parent: Option<BlockId>,
    /// Child ids, fixed fan-out when branched; a leaf has none
    pub children: Vec<BlockId>,
    /// One entry per direction, always [`NEIGHBOR_DIRECTIONS`] long
    pub neighbors: Vec<NeighborLinks>,
    pub face_index_count: u64,
    pub mesh_components: Vec<i32>,
    pub graph_id: Option<BlockId>,
    pub point_index_ids: Vec<BlockId>,
    pub uv_id: Option<BlockId>,
    pub uv_index_ids: Vec<BlockId>,
    pub texture_ids: Vec<BlockId>,
    pub clip_set_ids: Vec<u64>,
}

impl Default for NodeHeader {
    fn default() -> Self {
        NodeHeader {
            split_threshold: 0,
            is_leaf: true,
            is_branched: false,
            filtered: false,
            node_extent: Extent3d::default(),
            content_extent: None,
            level: 0,
            total_count: None,
            node_count: 0,
            are_points_3d: false,
            is_textured: false,
            parent: None,
            children: Vec::new(),
            neighbors: vec![NeighborLinks::default(); NEIGHBOR_DIRECTIONS],
            face_index_count: 0,
            mesh_components: Vec::new(),
            graph_id: None,
            point_index_ids: Vec::new(),
            uv_id: None,
            uv_index_ids: Vec::new(),
            texture_ids: Vec::new(),
            clip_set_ids: Vec::new(),
        }
    }
}

impl NodeHeader {
    /// Create a leaf header at the given level
    pub fn leaf(level: u64, node_extent: Extent3d) -> Self {
        NodeHeader {
            level,
            node_extent,
            ..Default::default()
        }
    }

    /// The single unsplit child, if this node has one
    pub fn no_split_child(&self) -> Option<BlockId> {
        if !self.is_leaf && !self.is_branched && self.children.len() == 1 {
            Some(self.children[0])
        } else {
            None
        }
    }

    /// Check structural invariants before persisting
    pub fn validate(&self) -> crate::Result<()> {
        if self.is_leaf && !self.children.is_empty() {
            return Err(crate::Error::Corrupt(format!(
                "Leaf node has {} children",
                self.children.len()
            )));
        }
        if !self.is_leaf && !self.is_branched && self.children.len() > 1 {
            return Err(crate::Error::Corrupt(format!(
                "Unsplit node has {} children",
                self.children.len()
            )));
        }
        if self.neighbors.len() != NEIGHBOR_DIRECTIONS {
            return Err(crate::Error::Corrupt(format!(
                "Expected {} neighbor directions, got {}",
                NEIGHBOR_DIRECTIONS,
                self.neighbors.len()
            )));
        }
        Ok(())
    }

    /// Bitmask of stitched directions, bit `i` for direction `i`
    pub fn stitched_mask(&self) -> u64 {
        self.neighbors
            .iter()
            .enumerate()
            .filter(|(_, n)| n.stitched)
            .fold(0u64, |mask, (i, _)| mask | (1 << i))
    }

    pub(crate) fn apply_stitched_mask(&mut self, mask: u64) {
        for (i, links) in self.neighbors.iter_mut().enumerate() {
            links.stitched = mask & (1 << i) != 0;
        }
    }
}

/// The root record describing a whole tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub split_threshold: u64,
    pub balanced: bool,
    /// Maximum extent of the index, when bounded
    pub max_extent: Option<Extent3d>,
    pub single_file: bool,
    /// Children per split node
    pub fan_out: u64,
    pub depth: u64,
    pub terrain_depth: u64,
    pub root_node_id: Option<BlockId>,
    pub is_terrain: bool,
    pub resolution: f64,
}

impl Default for IndexHeader {
    fn default() -> Self {
        IndexHeader {
            split_threshold: 10_000,
            balanced: false,
            max_extent: None,
            single_file: true,
            fan_out: 4,
            depth: 0,
            terrain_depth: 0,
            root_node_id: None,
            is_terrain: true,
            resolution: 0.0,
        }
    }
}
