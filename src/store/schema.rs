//! Table layouts and release history of each store file
//!
//! One descriptor per kind of file: the main index, clip definitions,
//! diffsets and features. `create_tables` always builds the current schema;
//! the migrations bring files written by earlier releases up to it.

use super::versioned::{Migration, StoreDescriptor};
use crate::codec::ZstdCodec;
use crate::model::SchemaVersion;
use crate::Result;
use rusqlite::Connection;

/// A table holding one compressed payload per id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobTable {
    pub table: &'static str,
    pub id_column: &'static str,
}

impl BlobTable {
    pub const fn new(table: &'static str, id_column: &'static str) -> Self {
        BlobTable { table, id_column }
    }

    fn ddl(&self) -> String {
        format!(
            "CREATE TABLE {} ({} INTEGER PRIMARY KEY AUTOINCREMENT, data BLOB, size INTEGER NOT NULL DEFAULT 0)",
            self.table, self.id_column
        )
    }
}

pub const POINTS: BlobTable = BlobTable::new("points", "node_id");
pub const INDICES: BlobTable = BlobTable::new("indices", "node_id");
pub const UVS: BlobTable = BlobTable::new("uvs", "node_id");
pub const UV_INDICES: BlobTable = BlobTable::new("uv_indices", "node_id");
pub const TEXTURES: BlobTable = BlobTable::new("textures", "node_id");
pub const GRAPHS: BlobTable = BlobTable::new("graphs", "node_id");

pub const CLIP_POLYGONS: BlobTable = BlobTable::new("clip_polygons", "polygon_id");
pub const SKIRT_POLYGONS: BlobTable = BlobTable::new("skirt_polygons", "polygon_id");
pub const COVERAGE_POLYGONS: BlobTable = BlobTable::new("coverage_polygons", "polygon_id");

pub const DIFFSETS: BlobTable = BlobTable::new("diffsets", "diffset_id");
pub const FEATURES: BlobTable = BlobTable::new("features", "feature_id");

// === Main index ===

const MASTER_HEADER_DDL: &str = "CREATE TABLE master_header (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    split_threshold INTEGER NOT NULL,
    balanced INTEGER NOT NULL,
    max_extent BLOB,
    single_file INTEGER NOT NULL,
    fan_out INTEGER NOT NULL,
    depth INTEGER NOT NULL,
    terrain_depth INTEGER NOT NULL,
    root_node_id INTEGER NOT NULL
)";

const NODE_HEADERS_DDL: &str = "CREATE TABLE node_headers (
    node_id INTEGER PRIMARY KEY,
    parent_id INTEGER NOT NULL,
    no_split_child_id INTEGER NOT NULL,
    level INTEGER NOT NULL,
    is_branched INTEGER NOT NULL,
    is_leaf INTEGER NOT NULL,
    filtered INTEGER NOT NULL,
    split_threshold INTEGER NOT NULL,
    total_count INTEGER,
    node_count INTEGER NOT NULL,
    are_points_3d INTEGER NOT NULL,
    is_textured INTEGER NOT NULL,
    face_index_count INTEGER NOT NULL,
    graph_id INTEGER NOT NULL,
    uv_id INTEGER NOT NULL,
    node_extent BLOB NOT NULL,
    content_extent BLOB,
    point_index_ids BLOB,
    uv_index_ids BLOB,
    texture_ids BLOB,
    children BLOB,
    neighbors BLOB NOT NULL,
    stitched_mask INTEGER NOT NULL DEFAULT 0
)";

pub const MAIN_INDEX_V1_0: SchemaVersion = SchemaVersion::new(1, 0, 0, 0);
pub const MAIN_INDEX_V1_1: SchemaVersion = SchemaVersion::new(1, 1, 0, 0);
pub const MAIN_INDEX_V1_1_1: SchemaVersion = SchemaVersion::new(1, 1, 0, 1);
pub const MAIN_INDEX_V1_1_2: SchemaVersion = SchemaVersion::new(1, 1, 0, 2);
pub const MAIN_INDEX_V1_1_3: SchemaVersion = SchemaVersion::new(1, 1, 0, 3);

/// Schema of releases 1.0.0.0, before UV indices, clip sets, mesh components
/// and terrain flags existed
pub(crate) fn create_main_index_v1_0(conn: &Connection) -> Result<()> {
    conn.execute_batch(MASTER_HEADER_DDL)?;
    conn.execute_batch(NODE_HEADERS_DDL)?;
    for table in [POINTS, INDICES, UVS, TEXTURES, GRAPHS] {
        conn.execute_batch(&table.ddl())?;
    }
    Ok(())
}

fn create_main_index(conn: &Connection) -> Result<()> {
    create_main_index_v1_0(conn)?;
    add_uv_indices(conn)?;
    add_clip_sets(conn)?;
    add_mesh_components(conn)?;
    add_terrain_flags(conn)?;
    Ok(())
}

fn add_uv_indices(conn: &Connection) -> Result<()> {
    conn.execute_batch(&UV_INDICES.ddl())?;
    Ok(())
}

fn add_clip_sets(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE node_headers ADD COLUMN clip_set_ids BLOB")?;
    Ok(())
}

fn add_mesh_components(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE node_headers ADD COLUMN nb_mesh_components INTEGER NOT NULL DEFAULT 0;
         ALTER TABLE node_headers ADD COLUMN mesh_components BLOB;",
    )?;
    Ok(())
}

fn add_terrain_flags(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE master_header ADD COLUMN is_terrain INTEGER NOT NULL DEFAULT 1;
         ALTER TABLE master_header ADD COLUMN resolution REAL NOT NULL DEFAULT 0;",
    )?;
    Ok(())
}

static MAIN_INDEX_MIGRATIONS: [Migration; 4] = [
    Migration {
        from: MAIN_INDEX_V1_0,
        to: MAIN_INDEX_V1_1,
        apply: add_uv_indices,
        cost: 1,
    },
    Migration {
        from: MAIN_INDEX_V1_1,
        to: MAIN_INDEX_V1_1_1,
        apply: add_clip_sets,
        cost: 1,
    },
    Migration {
        from: MAIN_INDEX_V1_1_1,
        to: MAIN_INDEX_V1_1_2,
        apply: add_mesh_components,
        cost: 1,
    },
    Migration {
        from: MAIN_INDEX_V1_1_2,
        to: MAIN_INDEX_V1_1_3,
        apply: add_terrain_flags,
        cost: 1,
    },
];

/// Main index: master header, node headers and per-node attachments
pub static MAIN_INDEX: StoreDescriptor = StoreDescriptor {
    name: "main_index",
    current: MAIN_INDEX_V1_1_3,
    create_tables: create_main_index,
    migrations: &MAIN_INDEX_MIGRATIONS,
};

// === Clip definitions ===

pub const CLIP_V1_0: SchemaVersion = SchemaVersion::new(1, 0, 0, 0);
pub const CLIP_V1_0_1: SchemaVersion = SchemaVersion::new(1, 0, 0, 1);
pub const CLIP_V1_0_2: SchemaVersion = SchemaVersion::new(1, 0, 0, 2);
pub const CLIP_V1_0_3: SchemaVersion = SchemaVersion::new(1, 0, 0, 3);

pub(crate) fn create_clip_definitions_v1_0(conn: &Connection) -> Result<()> {
    conn.execute_batch(&CLIP_POLYGONS.ddl())?;
    conn.execute_batch(&SKIRT_POLYGONS.ddl())?;
    Ok(())
}

fn create_clip_definitions(conn: &Connection) -> Result<()> {
    create_clip_definitions_v1_0(conn)?;
    add_clip_classification(conn)?;
    add_clip_metadata(conn)?;
    add_coverages(conn)?;
    Ok(())
}

fn add_clip_classification(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE clip_polygons ADD COLUMN geometry_type INTEGER NOT NULL DEFAULT 0;
         ALTER TABLE clip_polygons ADD COLUMN clip_kind INTEGER NOT NULL DEFAULT 0;
         ALTER TABLE clip_polygons ADD COLUMN is_active INTEGER NOT NULL DEFAULT 1;",
    )?;
    Ok(())
}

fn add_clip_metadata(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE clip_polygons ADD COLUMN importance REAL NOT NULL DEFAULT 0;
         ALTER TABLE clip_polygons ADD COLUMN dimension INTEGER NOT NULL DEFAULT 0;",
    )?;
    Ok(())
}

fn add_coverages(conn: &Connection) -> Result<()> {
    conn.execute_batch(&COVERAGE_POLYGONS.ddl())?;
    conn.execute_batch(
        "CREATE TABLE coverage_names (
            polygon_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT ''
        )",
    )?;
    Ok(())
}

static CLIP_MIGRATIONS: [Migration; 3] = [
    Migration {
        from: CLIP_V1_0,
        to: CLIP_V1_0_1,
        apply: add_clip_classification,
        cost: 1,
    },
    Migration {
        from: CLIP_V1_0_1,
        to: CLIP_V1_0_2,
        apply: add_clip_metadata,
        cost: 1,
    },
    Migration {
        from: CLIP_V1_0_2,
        to: CLIP_V1_0_3,
        apply: add_coverages,
        cost: 1,
    },
];

/// Clip, skirt and coverage polygons
pub static CLIP_DEFINITIONS: StoreDescriptor = StoreDescriptor {
    name: "clip_definitions",
    current: CLIP_V1_0_3,
    create_tables: create_clip_definitions,
    migrations: &CLIP_MIGRATIONS,
};

// === Diffsets ===

pub const DIFFSET_V1_0: SchemaVersion = SchemaVersion::new(1, 0, 0, 0);
pub const DIFFSET_V1_0_1: SchemaVersion = SchemaVersion::new(1, 0, 0, 1);

pub(crate) fn create_diffsets_v1_0(conn: &Connection) -> Result<()> {
    conn.execute_batch(&DIFFSETS.ddl())?;
    Ok(())
}

fn create_diffsets(conn: &Connection) -> Result<()> {
    create_diffsets_v1_0(conn)?;
    conn.execute_batch("ALTER TABLE diffsets ADD COLUMN count INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

/// Adds the logical element count column, filled from each packed payload
fn add_diffset_counts(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE diffsets ADD COLUMN count INTEGER NOT NULL DEFAULT 0")?;

    let codec = ZstdCodec::default();
    let mut rows = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT diffset_id, data, size FROM diffsets")?;
        let mut query = stmt.query([])?;
        while let Some(row) = query.next()? {
            let id: i64 = row.get(0)?;
            let data: Option<Vec<u8>> = row.get(1)?;
            let size: i64 = row.get(2)?;
            rows.push((id, data.unwrap_or_default(), size as usize));
        }
    }

    let mut update = conn.prepare("UPDATE diffsets SET count = ?1 WHERE diffset_id = ?2")?;
    for (id, data, size) in rows {
        let raw = codec.decompress(&data, size)?;
        let count = super::diffset::packed_count(&raw)?;
        update.execute(rusqlite::params![count as i64, id])?;
    }
    Ok(())
}

static DIFFSET_MIGRATIONS: [Migration; 1] = [Migration {
    from: DIFFSET_V1_0,
    to: DIFFSET_V1_0_1,
    apply: add_diffset_counts,
    cost: 10,
}];

/// Incremental edit sets
pub static DIFFSET_STORE: StoreDescriptor = StoreDescriptor {
    name: "diffsets",
    current: DIFFSET_V1_0_1,
    create_tables: create_diffsets,
    migrations: &DIFFSET_MIGRATIONS,
};

// === Features ===

fn create_features(conn: &Connection) -> Result<()> {
    conn.execute_batch(&FEATURES.ddl())?;
    // Kind shared by every feature of the row, NULL when mixed or empty
    conn.execute_batch("ALTER TABLE features ADD COLUMN feature_type INTEGER")?;
    Ok(())
}

/// Linear features
pub static FEATURE_STORE: StoreDescriptor = StoreDescriptor {
    name: "features",
    current: SchemaVersion::new(1, 0, 0, 0),
    create_tables: create_features,
    migrations: &[],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusyPolicy;
    use crate::store::versioned::{OpenMode, VersionedStore};
    use tempfile::tempdir;

    static MAIN_INDEX_1_0: StoreDescriptor = StoreDescriptor {
        name: "main_index",
        current: MAIN_INDEX_V1_0,
        create_tables: create_main_index_v1_0,
        migrations: &[],
    };

    static CLIP_1_0: StoreDescriptor = StoreDescriptor {
        name: "clip_definitions",
        current: CLIP_V1_0,
        create_tables: create_clip_definitions_v1_0,
        migrations: &[],
    };

    fn columns(store: &VersionedStore, table: &str) -> Vec<String> {
        store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row?);
                }
                Ok(names)
            })
            .unwrap()
    }

    #[test]
    fn test_release_histories_are_complete() {
        for descriptor in [&MAIN_INDEX, &CLIP_DEFINITIONS, &DIFFSET_STORE] {
            let oldest = descriptor
                .migrations
                .iter()
                .map(|m| m.from)
                .min()
                .unwrap();
            let path = descriptor.migration_path(oldest).unwrap();
            assert_eq!(path.len(), descriptor.migrations.len(), "{}", descriptor.name);
        }
        assert!(FEATURE_STORE
            .migration_path(FEATURE_STORE.current)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_main_index_upgrade_matches_fresh_schema() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.db");
        let new_path = dir.path().join("new.db");

        VersionedStore::create(&old_path, &MAIN_INDEX_1_0, BusyPolicy::default())
            .unwrap()
            .close()
            .unwrap();
        let upgraded =
            VersionedStore::open(&old_path, &MAIN_INDEX, OpenMode::ReadWrite, BusyPolicy::default())
                .unwrap();
        let fresh = VersionedStore::create(&new_path, &MAIN_INDEX, BusyPolicy::default()).unwrap();

        assert_eq!(upgraded.version(), MAIN_INDEX_V1_1_3);
        for table in ["master_header", "node_headers", "uv_indices"] {
            assert_eq!(columns(&upgraded, table), columns(&fresh, table), "{}", table);
        }
    }

    #[test]
    fn test_clip_upgrade_adds_classification_and_coverages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clips.db");
        VersionedStore::create(&path, &CLIP_1_0, BusyPolicy::default())
            .unwrap()
            .close()
            .unwrap();

        let store =
            VersionedStore::open(&path, &CLIP_DEFINITIONS, OpenMode::ReadOnly, BusyPolicy::default())
                .unwrap();
        let cols = columns(&store, "clip_polygons");
        for expected in ["geometry_type", "clip_kind", "is_active", "importance", "dimension"] {
            assert!(cols.iter().any(|c| c == expected), "missing {}", expected);
        }
        assert!(store.has_table("coverage_names").unwrap());
    }
}
