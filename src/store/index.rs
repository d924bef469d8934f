//! The main index file and its sidecars
//!
//! A mesh is stored as one main index file holding the headers and the
//! per-node attachments, plus optional sidecar files next to it:
//! ```text
//! <stem>.db            headers, points, indices, uvs, uv indices, textures, graphs
//! <stem>.clips.db      clip, skirt and coverage polygons
//! <stem>.diffsets.db   edit sets
//! <stem>.features.db   linear features
//! ```

use super::block::BlockStore;
use super::diffset::DiffSetStore;
use super::feature::FeatureStore;
use super::headers;
use super::schema::{GRAPHS, INDICES, MAIN_INDEX, POINTS, TEXTURES, UVS, UV_INDICES};
use super::tiles::TileStore;
use super::versioned::{OpenMode, VersionedStore};
use crate::clip::ClipRegistry;
use crate::config::StoreOptions;
use crate::model::{BlockId, IndexHeader, NodeHeader, Point2d, Point3d, SchemaVersion};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Path of a sidecar file: `<dir>/<stem>.<suffix>.db`
pub fn sidecar_path(index: &Path, suffix: &str) -> PathBuf {
    let stem = index
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    index.with_file_name(format!("{}.{}.db", stem, suffix))
}

/// A mesh's main index file with its attachment stores
pub struct MeshIndexStore {
    db: Arc<VersionedStore>,
    options: StoreOptions,
    points: TileStore<Point3d>,
    indices: TileStore<i32>,
    uvs: TileStore<Point2d>,
    uv_indices: TileStore<i32>,
    textures: TileStore<u8>,
    graphs: TileStore<u8>,
    clips: ClipRegistry,
    diffsets: Mutex<Option<Arc<DiffSetStore>>>,
    features: Mutex<Option<Arc<FeatureStore>>>,
}

impl MeshIndexStore {
    /// Create a new main index; fails when the file exists
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let db = VersionedStore::create(path.as_ref(), &MAIN_INDEX, options.busy)?;
        info!(path = %path.as_ref().display(), "mesh_index.create");
        Ok(Self::assemble(db, options))
    }

    /// Open an existing main index, migrating it if needed
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let db = VersionedStore::open(path.as_ref(), &MAIN_INDEX, mode, options.busy)?;
        Ok(Self::assemble(db, options))
    }

    pub fn open_or_create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, OpenMode::ReadWrite, options)
        } else {
            Self::create(path, options)
        }
    }

    fn assemble(db: VersionedStore, options: StoreOptions) -> Self {
        let db = Arc::new(db);
        let codec = options.payload_codec();
        let clips = ClipRegistry::new(
            sidecar_path(db.path(), "clips"),
            db.mode(),
            options.clone(),
        );
        MeshIndexStore {
            points: TileStore::new(db.clone(), POINTS, codec).with_headers(),
            indices: TileStore::new(db.clone(), INDICES, codec),
            uvs: TileStore::new(db.clone(), UVS, codec),
            uv_indices: TileStore::new(db.clone(), UV_INDICES, codec),
            textures: TileStore::new(db.clone(), TEXTURES, options.texture_codec()),
            graphs: TileStore::new(db.clone(), GRAPHS, codec),
            clips,
            diffsets: Mutex::new(None),
            features: Mutex::new(None),
            db,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn version(&self) -> SchemaVersion {
        self.db.version()
    }

    pub fn mode(&self) -> OpenMode {
        self.db.mode()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn db(&self) -> &Arc<VersionedStore> {
        &self.db
    }

    pub fn store_master_header(&self, header: &IndexHeader) -> Result<()> {
        self.points.store_master_header(header)
    }

    pub fn load_master_header(&self) -> Result<Option<IndexHeader>> {
        self.points.load_master_header()
    }

    pub fn store_node_header(&self, header: &NodeHeader, id: BlockId) -> Result<()> {
        self.points.store_node_header(header, id)
    }

    pub fn load_node_header(&self, id: BlockId) -> Result<Option<NodeHeader>> {
        self.points.load_node_header(id)
    }

    pub fn destroy_node_header(&self, id: BlockId) -> Result<bool> {
        self.db
            .with_write(|conn| headers::destroy_node_header(conn, id))
    }

    /// Ids of every node with a stored header
    pub fn node_ids(&self) -> Result<Vec<BlockId>> {
        self.db.with_conn(headers::node_header_ids)
    }

    /// Node points; this store also serves the headers
    pub fn points(&self) -> &TileStore<Point3d> {
        &self.points
    }

    pub fn indices(&self) -> &TileStore<i32> {
        &self.indices
    }

    pub fn uvs(&self) -> &TileStore<Point2d> {
        &self.uvs
    }

    pub fn uv_indices(&self) -> &TileStore<i32> {
        &self.uv_indices
    }

    pub fn textures(&self) -> &TileStore<u8> {
        &self.textures
    }

    pub fn graphs(&self) -> &TileStore<u8> {
        &self.graphs
    }

    pub fn clips(&self) -> &ClipRegistry {
        &self.clips
    }

    /// The diffset sidecar, created on first use when writable
    pub fn diffsets(&self) -> Result<Arc<DiffSetStore>> {
        let mut slot = self.diffsets.lock();
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }
        let path = sidecar_path(self.path(), "diffsets");
        let store = match self.mode() {
            OpenMode::ReadWrite => DiffSetStore::open_or_create(&path, &self.options)?,
            OpenMode::ReadOnly => DiffSetStore::open(&path, OpenMode::ReadOnly, &self.options)?,
        };
        let store = Arc::new(store);
        *slot = Some(store.clone());
        Ok(store)
    }

    /// The feature sidecar, created on first use when writable
    pub fn features(&self) -> Result<Arc<FeatureStore>> {
        let mut slot = self.features.lock();
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }
        let path = sidecar_path(self.path(), "features");
        let store = match self.mode() {
            OpenMode::ReadWrite => FeatureStore::open_or_create(&path, &self.options)?,
            OpenMode::ReadOnly => FeatureStore::open(&path, OpenMode::ReadOnly, &self.options)?,
        };
        let store = Arc::new(store);
        *slot = Some(store.clone());
        Ok(store)
    }

    /// Flush every open file
    pub fn save(&self) -> Result<()> {
        self.db.save()?;
        self.clips.save()?;
        if let Some(diffsets) = self.diffsets.lock().as_ref() {
            diffsets.save()?;
        }
        Ok(())
    }

    /// Flush and close every open file
    pub fn close(&self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        let mut keep = |result: Result<()>| {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        };

        keep(self.clips.close());
        if let Some(diffsets) = self.diffsets.lock().take() {
            keep(diffsets.close());
        }
        if let Some(features) = self.features.lock().take() {
            keep(features.close());
        }
        keep(self.db.close());

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
