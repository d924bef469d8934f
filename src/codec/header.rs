//! Binary layout of node and index headers
//!
//! Layout of a node header, in order:
//! ```text
//! filtered            u8
//! parent id           u64
//! no-split child id   u64
//! level               u64
//! is branched         u8
//! is leaf             u8
//! split threshold     u64
//! total count         u64   (all ones when undefined)
//! node count          u64
//! points are 3D       u8
//! face index count    u64
//! graph id            u64
//! node extent         6 x f64
//! content defined     u8, then 6 x f64 when set
//! point-index ids     u64 count, count x u64
//! uv id               u64
//! uv-index ids        u64 count, count x u64
//! texture ids         u64 count, count x u64
//! mesh components     u64 count, count x i64
//! clip sets           u64 count, count x u64
//! children            u64 count, count x u64
//! neighbors           26 x (u64 count, count x u64)
//! [textured           u8]
//! [stitched mask      u64]
//! ```
//! Flags are single bytes, every wider field is 8 bytes little-endian and
//! absent ids are the all-ones sentinel. The bracketed extension block is
//! optional on read. An unsplit node's only child is written to the no-split
//! field with an empty child array.

use super::cursor::{put_id, put_ids, ByteReader};
use crate::model::{BlockId, Extent3d, IndexHeader, NeighborLinks, NodeHeader, NEIGHBOR_DIRECTIONS};
use crate::{Error, Result};
use bytes::BufMut;

const UNDEFINED_COUNT: u64 = u64::MAX;

fn put_bool(out: &mut Vec<u8>, flag: bool) {
    out.put_u8(flag as u8);
}

pub(crate) fn put_extent(out: &mut Vec<u8>, extent: &Extent3d) {
    for v in extent.to_array() {
        out.put_f64_le(v);
    }
}

pub(crate) fn read_extent(reader: &mut ByteReader<'_>) -> Result<Extent3d> {
    let mut values = [0f64; 6];
    for v in values.iter_mut() {
        *v = reader.f64()?;
    }
    Ok(Extent3d::from_array(values))
}

/// Encode the 26 neighbor id lists (without stitched flags)
pub(crate) fn put_neighbors(out: &mut Vec<u8>, neighbors: &[NeighborLinks]) {
    for links in neighbors {
        put_ids(out, &links.ids);
    }
}

pub(crate) fn read_neighbors(reader: &mut ByteReader<'_>) -> Result<Vec<NeighborLinks>> {
    (0..NEIGHBOR_DIRECTIONS)
        .map(|_| {
            Ok(NeighborLinks {
                ids: reader.ids()?,
                stitched: false,
            })
        })
        .collect()
}

pub(crate) fn put_mesh_components(out: &mut Vec<u8>, components: &[i32]) {
    out.put_u64_le(components.len() as u64);
    for c in components {
        out.put_i64_le(*c as i64);
    }
}

pub(crate) fn read_mesh_components(reader: &mut ByteReader<'_>) -> Result<Vec<i32>> {
    let count = reader.count(8)?;
    (0..count)
        .map(|_| {
            let v = reader.i64()?;
            i32::try_from(v)
                .map_err(|_| Error::Corrupt(format!("Mesh component {} out of range", v)))
        })
        .collect()
}

pub(crate) fn put_u64s(out: &mut Vec<u8>, values: &[u64]) {
    out.put_u64_le(values.len() as u64);
    for v in values {
        out.put_u64_le(*v);
    }
}

pub(crate) fn read_u64s(reader: &mut ByteReader<'_>) -> Result<Vec<u64>> {
    let count = reader.count(8)?;
    (0..count).map(|_| reader.u64()).collect()
}

/// Encode a node header in the streaming layout
pub fn encode_node_header(header: &NodeHeader) -> Result<Vec<u8>> {
    header.validate()?;
    let no_split = header.no_split_child();

    let mut out = Vec::with_capacity(256 + NEIGHBOR_DIRECTIONS * 8);
    put_bool(&mut out, header.filtered);
    put_id(&mut out, BlockId::from_option(header.parent));
    put_id(&mut out, BlockId::from_option(no_split));
    out.put_u64_le(header.level);
    put_bool(&mut out, header.is_branched);
    put_bool(&mut out, header.is_leaf);
    out.put_u64_le(header.split_threshold);
    out.put_u64_le(header.total_count.unwrap_or(UNDEFINED_COUNT));
    out.put_u64_le(header.node_count);
    put_bool(&mut out, header.are_points_3d);
    out.put_u64_le(header.face_index_count);
    put_id(&mut out, BlockId::from_option(header.graph_id));
    put_extent(&mut out, &header.node_extent);
    match &header.content_extent {
        Some(extent) => {
            put_bool(&mut out, true);
            put_extent(&mut out, extent);
        }
        None => put_bool(&mut out, false),
    }
    put_ids(&mut out, &header.point_index_ids);
    put_id(&mut out, BlockId::from_option(header.uv_id));
    put_ids(&mut out, &header.uv_index_ids);
    put_ids(&mut out, &header.texture_ids);
    put_mesh_components(&mut out, &header.mesh_components);
    put_u64s(&mut out, &header.clip_set_ids);
    if no_split.is_some() {
        put_ids(&mut out, &[]);
    } else {
        put_ids(&mut out, &header.children);
    }
    put_neighbors(&mut out, &header.neighbors);

    put_bool(&mut out, header.is_textured);
    out.put_u64_le(header.stitched_mask());
    Ok(out)
}

/// Decode a node header from the streaming layout
pub fn decode_node_header(buf: &[u8]) -> Result<NodeHeader> {
    let mut r = ByteReader::new(buf);

    let filtered = r.bool()?;
    let parent = r.id()?.to_option();
    let no_split = r.id()?.to_option();
    let level = r.u64()?;
    let is_branched = r.bool()?;
    let is_leaf = r.bool()?;
    let split_threshold = r.u64()?;
    let total_count = Some(r.u64()?).filter(|c| *c != UNDEFINED_COUNT);
    let node_count = r.u64()?;
    let are_points_3d = r.bool()?;
    let face_index_count = r.u64()?;
    let graph_id = r.id()?.to_option();
    let node_extent = read_extent(&mut r)?;
    let content_extent = if r.bool()? {
        Some(read_extent(&mut r)?)
    } else {
        None
    };
    let point_index_ids = r.ids()?;
    let uv_id = r.id()?.to_option();
    let uv_index_ids = r.ids()?;
    let texture_ids = r.ids()?;
    let mesh_components = read_mesh_components(&mut r)?;
    let clip_set_ids = read_u64s(&mut r)?;
    let mut children = r.ids()?;
    if let Some(child) = no_split {
        if !children.is_empty() {
            return Err(Error::Corrupt(
                "Node has both a no-split child and split children".into(),
            ));
        }
        children.push(child);
    }
    let neighbors = read_neighbors(&mut r)?;

    let mut header = NodeHeader {
        split_threshold,
        is_leaf,
        is_branched,
        filtered,
        node_extent,
        content_extent,
        level,
        total_count,
        node_count,
        are_points_3d,
        is_textured: false,
        parent,
        children,
        neighbors,
        face_index_count,
        mesh_components,
        graph_id,
        point_index_ids,
        uv_id,
        uv_index_ids,
        texture_ids,
        clip_set_ids,
    };

    if !r.is_empty() {
        header.is_textured = r.bool()?;
        let mask = r.u64()?;
        header.apply_stitched_mask(mask);
    }
    Ok(header)
}

/// Encode an index header; these are the master-header bytes of the streaming store
pub fn encode_index_header(header: &IndexHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.put_u64_le(header.split_threshold);
    put_bool(&mut out, header.balanced);
    match &header.max_extent {
        Some(extent) => {
            put_bool(&mut out, true);
            put_extent(&mut out, extent);
        }
        None => put_bool(&mut out, false),
    }
    put_bool(&mut out, header.single_file);
    out.put_u64_le(header.fan_out);
    out.put_u64_le(header.depth);
    out.put_u64_le(header.terrain_depth);
    put_id(&mut out, BlockId::from_option(header.root_node_id));
    put_bool(&mut out, header.is_terrain);
    out.put_f64_le(header.resolution);
    out
}

pub fn decode_index_header(buf: &[u8]) -> Result<IndexHeader> {
    let mut r = ByteReader::new(buf);
    let split_threshold = r.u64()?;
    let balanced = r.bool()?;
    let max_extent = if r.bool()? {
        Some(read_extent(&mut r)?)
    } else {
        None
    };
    Ok(IndexHeader {
        split_threshold,
        balanced,
        max_extent,
        single_file: r.bool()?,
        fan_out: r.u64()?,
        depth: r.u64()?,
        terrain_depth: r.u64()?,
        root_node_id: r.id()?.to_option(),
        is_terrain: r.bool()?,
        resolution: r.f64()?,
    })
}
