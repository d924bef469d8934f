//! Columnar rows for index and node headers
//!
//! Id lists are stored as concatenated little-endian u64 blobs, neighbor
//! lists in the same count-prefixed layout as the streaming header, and the
//! stitched directions as one bitmask column.

use crate::codec::header::{put_extent, put_neighbors, read_extent, read_neighbors};
use crate::codec::ByteReader;
use crate::model::{BlockId, Extent3d, IndexHeader, NodeHeader};
use crate::{Error, Result};
use bytes::BufMut;
use rusqlite::{named_params, Connection, OptionalExtension, Row};

const MASTER_ROW: i64 = 0;

fn extent_blob(extent: &Extent3d) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    put_extent(&mut out, extent);
    out
}

fn blob_extent(blob: &[u8]) -> Result<Extent3d> {
    read_extent(&mut ByteReader::new(blob))
}

fn ids_blob(ids: &[BlockId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        out.put_u64_le(id.raw());
    }
    out
}

fn blob_ids(blob: Option<Vec<u8>>) -> Result<Vec<BlockId>> {
    Ok(blob_u64s(blob)?.into_iter().map(BlockId::new).collect())
}

fn u64s_blob(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.put_u64_le(*v);
    }
    out
}

fn blob_u64s(blob: Option<Vec<u8>>) -> Result<Vec<u64>> {
    let blob = blob.unwrap_or_default();
    if blob.len() % 8 != 0 {
        return Err(Error::Corrupt(format!(
            "Id list of {} bytes is not a multiple of 8",
            blob.len()
        )));
    }
    let mut reader = ByteReader::new(&blob);
    (0..blob.len() / 8).map(|_| reader.u64()).collect()
}

fn components_blob(components: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(components.len() * 4);
    for c in components {
        out.put_i32_le(*c);
    }
    out
}

fn blob_components(blob: Option<Vec<u8>>, count: i64) -> Result<Vec<i32>> {
    let blob = blob.unwrap_or_default();
    if count < 0 || blob.len() != count as usize * 4 {
        return Err(Error::Corrupt(format!(
            "{} mesh components stored in {} bytes",
            count,
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn link(id: Option<BlockId>) -> i64 {
    BlockId::from_option(id).as_sql()
}

fn unlink(raw: i64) -> Option<BlockId> {
    BlockId::from_sql(raw).to_option()
}

fn count(raw: i64) -> u64 {
    raw as u64
}

/// Write the single index header row
pub fn store_master_header(conn: &Connection, header: &IndexHeader) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO master_header
            (id, split_threshold, balanced, max_extent, single_file, fan_out, depth,
             terrain_depth, root_node_id, is_terrain, resolution)
         VALUES
            (:id, :split_threshold, :balanced, :max_extent, :single_file, :fan_out, :depth,
             :terrain_depth, :root_node_id, :is_terrain, :resolution)",
        named_params! {
            ":id": MASTER_ROW,
            ":split_threshold": header.split_threshold as i64,
            ":balanced": header.balanced,
            ":max_extent": header.max_extent.as_ref().map(extent_blob),
            ":single_file": header.single_file,
            ":fan_out": header.fan_out as i64,
            ":depth": header.depth as i64,
            ":terrain_depth": header.terrain_depth as i64,
            ":root_node_id": link(header.root_node_id),
            ":is_terrain": header.is_terrain,
            ":resolution": header.resolution,
        },
    )?;
    Ok(())
}

/// Read the index header row, `None` before one was written
pub fn load_master_header(conn: &Connection) -> Result<Option<IndexHeader>> {
    let row = conn
        .query_row(
            "SELECT split_threshold, balanced, max_extent, single_file, fan_out, depth,
                    terrain_depth, root_node_id, is_terrain, resolution
             FROM master_header WHERE id = ?1",
            [MASTER_ROW],
            |row| {
                Ok((
                    IndexHeader {
                        split_threshold: count(row.get(0)?),
                        balanced: row.get(1)?,
                        max_extent: None,
                        single_file: row.get(3)?,
                        fan_out: count(row.get(4)?),
                        depth: count(row.get(5)?),
                        terrain_depth: count(row.get(6)?),
                        root_node_id: unlink(row.get(7)?),
                        is_terrain: row.get(8)?,
                        resolution: row.get(9)?,
                    },
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((mut header, extent)) => {
            header.max_extent = extent.as_deref().map(blob_extent).transpose()?;
            Ok(Some(header))
        }
        None => Ok(None),
    }
}

/// Insert or replace the header row of node `id`
pub fn store_node_header(conn: &Connection, id: BlockId, header: &NodeHeader) -> Result<()> {
    if !id.is_valid() {
        return Err(Error::Unsupported(
            "Node headers need an allocated node id".into(),
        ));
    }
    header.validate()?;

    let no_split = header.no_split_child();
    let children = if no_split.is_some() {
        Vec::new()
    } else {
        ids_blob(&header.children)
    };
    let mut neighbors = Vec::new();
    put_neighbors(&mut neighbors, &header.neighbors);

    conn.execute(
        "INSERT OR REPLACE INTO node_headers
            (node_id, parent_id, no_split_child_id, level, is_branched, is_leaf, filtered,
             split_threshold, total_count, node_count, are_points_3d, is_textured,
             face_index_count, graph_id, uv_id, node_extent, content_extent,
             point_index_ids, uv_index_ids, texture_ids, children, neighbors, stitched_mask,
             clip_set_ids, nb_mesh_components, mesh_components)
         VALUES
            (:node_id, :parent_id, :no_split_child_id, :level, :is_branched, :is_leaf, :filtered,
             :split_threshold, :total_count, :node_count, :are_points_3d, :is_textured,
             :face_index_count, :graph_id, :uv_id, :node_extent, :content_extent,
             :point_index_ids, :uv_index_ids, :texture_ids, :children, :neighbors, :stitched_mask,
             :clip_set_ids, :nb_mesh_components, :mesh_components)",
        named_params! {
            ":node_id": id.as_sql(),
            ":parent_id": link(header.parent),
            ":no_split_child_id": link(no_split),
            ":level": header.level as i64,
            ":is_branched": header.is_branched,
            ":is_leaf": header.is_leaf,
            ":filtered": header.filtered,
            ":split_threshold": header.split_threshold as i64,
            ":total_count": header.total_count.map(|c| c as i64),
            ":node_count": header.node_count as i64,
            ":are_points_3d": header.are_points_3d,
            ":is_textured": header.is_textured,
            ":face_index_count": header.face_index_count as i64,
            ":graph_id": link(header.graph_id),
            ":uv_id": link(header.uv_id),
            ":node_extent": extent_blob(&header.node_extent),
            ":content_extent": header.content_extent.as_ref().map(extent_blob),
            ":point_index_ids": ids_blob(&header.point_index_ids),
            ":uv_index_ids": ids_blob(&header.uv_index_ids),
            ":texture_ids": ids_blob(&header.texture_ids),
            ":children": children,
            ":neighbors": neighbors,
            ":stitched_mask": header.stitched_mask() as i64,
            ":clip_set_ids": u64s_blob(&header.clip_set_ids),
            ":nb_mesh_components": header.mesh_components.len() as i64,
            ":mesh_components": components_blob(&header.mesh_components),
        },
    )?;
    Ok(())
}

/// Raw column values of one node row, decoded outside the row callback
struct NodeRow {
    header: NodeHeader,
    no_split: Option<BlockId>,
    node_extent: Vec<u8>,
    content_extent: Option<Vec<u8>>,
    point_index_ids: Option<Vec<u8>>,
    uv_index_ids: Option<Vec<u8>>,
    texture_ids: Option<Vec<u8>>,
    children: Option<Vec<u8>>,
    neighbors: Vec<u8>,
    stitched_mask: i64,
    clip_set_ids: Option<Vec<u8>>,
    nb_mesh_components: i64,
    mesh_components: Option<Vec<u8>>,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let header = NodeHeader {
            parent: unlink(row.get("parent_id")?),
            level: count(row.get("level")?),
            is_branched: row.get("is_branched")?,
            is_leaf: row.get("is_leaf")?,
            filtered: row.get("filtered")?,
            split_threshold: count(row.get("split_threshold")?),
            total_count: row.get::<_, Option<i64>>("total_count")?.map(count),
            node_count: count(row.get("node_count")?),
            are_points_3d: row.get("are_points_3d")?,
            is_textured: row.get("is_textured")?,
            face_index_count: count(row.get("face_index_count")?),
            graph_id: unlink(row.get("graph_id")?),
            uv_id: unlink(row.get("uv_id")?),
            ..Default::default()
        };
        Ok(NodeRow {
            header,
            no_split: unlink(row.get("no_split_child_id")?),
            node_extent: row.get("node_extent")?,
            content_extent: row.get("content_extent")?,
            point_index_ids: row.get("point_index_ids")?,
            uv_index_ids: row.get("uv_index_ids")?,
            texture_ids: row.get("texture_ids")?,
            children: row.get("children")?,
            neighbors: row.get("neighbors")?,
            stitched_mask: row.get("stitched_mask")?,
            clip_set_ids: row.get("clip_set_ids")?,
            nb_mesh_components: row.get("nb_mesh_components")?,
            mesh_components: row.get("mesh_components")?,
        })
    }

    fn into_header(self) -> Result<NodeHeader> {
        let mut header = self.header;
        header.node_extent = blob_extent(&self.node_extent)?;
        header.content_extent = self.content_extent.as_deref().map(blob_extent).transpose()?;
        header.point_index_ids = blob_ids(self.point_index_ids)?;
        header.uv_index_ids = blob_ids(self.uv_index_ids)?;
        header.texture_ids = blob_ids(self.texture_ids)?;
        header.children = blob_ids(self.children)?;
        if let Some(child) = self.no_split {
            if !header.children.is_empty() {
                return Err(Error::Corrupt(
                    "Node has both a no-split child and split children".into(),
                ));
            }
            header.children.push(child);
        }
        header.neighbors = read_neighbors(&mut ByteReader::new(&self.neighbors))?;
        header.apply_stitched_mask(self.stitched_mask as u64);
        header.clip_set_ids = blob_u64s(self.clip_set_ids)?;
        header.mesh_components = blob_components(self.mesh_components, self.nb_mesh_components)?;
        Ok(header)
    }
}

/// Read the header row of node `id`, `None` when absent
pub fn load_node_header(conn: &Connection, id: BlockId) -> Result<Option<NodeHeader>> {
    if !id.is_valid() {
        return Ok(None);
    }
    let row = conn
        .query_row(
            "SELECT * FROM node_headers WHERE node_id = ?1",
            [id.as_sql()],
            NodeRow::from_row,
        )
        .optional()?;
    row.map(NodeRow::into_header).transpose()
}

pub fn destroy_node_header(conn: &Connection, id: BlockId) -> Result<bool> {
    if !id.is_valid() {
        return Ok(false);
    }
    let removed = conn.execute("DELETE FROM node_headers WHERE node_id = ?1", [id.as_sql()])?;
    Ok(removed > 0)
}

/// Ids of every stored node header, ascending
pub fn node_header_ids(conn: &Connection) -> Result<Vec<BlockId>> {
    let mut stmt = conn.prepare("SELECT node_id FROM node_headers ORDER BY node_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(BlockId::from_sql(row?));
    }
    Ok(ids)
}
