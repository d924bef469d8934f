//! Clip registry integration tests
//!
//! Run with:
//! ```bash
//! cargo test --test clip_registry
//! ```

use rusqlite::Connection;
use smstore::config::BusyPolicy;
use smstore::store::sidecar_path;
use smstore::{
    BlockId, ClipKind, ClipRegistry, GeometryType, MeshIndexStore, OpenMode, Point3d, StoreOptions,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn square(size: f64) -> Vec<Point3d> {
    vec![
        Point3d::new(0.0, 0.0, 0.0),
        Point3d::new(size, 0.0, 0.0),
        Point3d::new(size, size, 0.0),
        Point3d::new(0.0, size, 0.0),
    ]
}

#[test]
fn test_clip_lifecycle_through_mesh_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("site.db");
    let index = MeshIndexStore::create(&path, StoreOptions::default()).unwrap();
    let clips = index.clips();

    assert!(!clips.exists());
    assert_eq!(clips.get_clip(BlockId::new(1)).unwrap(), None);

    let id = clips
        .add_clip_with_parameters(&square(10.0), GeometryType::Prism, ClipKind::Boundary, true)
        .unwrap();
    assert_eq!(id, BlockId::new(1));
    assert!(sidecar_path(&path, "clips").exists());

    clips.modify_clip(id, &square(20.0)).unwrap();
    let record = clips.get_clip_with_parameters(id).unwrap().unwrap();
    assert_eq!(record.points, square(20.0));
    assert_eq!(record.geometry, GeometryType::Prism);
    assert_eq!(record.kind, ClipKind::Boundary);

    assert!(clips.set_clip_on_or_off(id, false).unwrap());
    assert_eq!(clips.get_is_clip_active(id).unwrap(), Some(false));
    assert!(clips.delete_clip(id).unwrap());
    assert!(!clips.has_clip(id).unwrap());
    index.close().unwrap();
}

#[test]
fn test_registry_reopened_read_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mesh.clips.db");
    let (clip, skirt) = {
        let registry = ClipRegistry::new(&path, OpenMode::ReadWrite, StoreOptions::default());
        let clip = registry.add_clip(&square(1.0)).unwrap();
        let skirt = registry
            .add_skirts(&[square(1.0), vec![Point3d::new(5.0, 5.0, 5.0)]])
            .unwrap();
        registry.set_clip_metadata(clip, 0.75, 2).unwrap();
        registry.close().unwrap();
        (clip, skirt)
    };

    let registry = ClipRegistry::new(&path, OpenMode::ReadOnly, StoreOptions::default());
    assert_eq!(registry.get_clip(clip).unwrap(), Some(square(1.0)));
    assert_eq!(registry.get_clip_metadata(clip).unwrap(), Some((0.75, 2)));
    let polylines = registry.get_skirt(skirt).unwrap().unwrap().polylines();
    assert_eq!(polylines.len(), 2);
    assert_eq!(polylines[1], vec![Point3d::new(5.0, 5.0, 5.0)]);
    assert!(registry.add_clip(&square(2.0)).is_err());
}

#[test]
fn test_repeated_reads_hit_cache() {
    let dir = tempdir().unwrap();
    let registry = ClipRegistry::new(
        dir.path().join("mesh.clips.db"),
        OpenMode::ReadWrite,
        StoreOptions::default(),
    );
    let first = registry.add_clip(&square(1.0)).unwrap();
    let second = registry.add_clip(&square(2.0)).unwrap();

    // The last write occupies the cache
    registry.get_clip(second).unwrap();
    registry.get_clip(first).unwrap();
    registry.get_clip(first).unwrap();
    let stats = registry.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(ClipRegistry::new(
        dir.path().join("mesh.clips.db"),
        OpenMode::ReadWrite,
        StoreOptions::default(),
    ));
    let id = registry.add_clip(&square(1.0)).unwrap();

    let writer = {
        let registry = registry.clone();
        thread::spawn(move || {
            for size in 2..50 {
                registry.modify_clip(id, &square(size as f64)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let points = registry.get_clip(id).unwrap().unwrap();
                    // Every read sees one whole polygon, never a mix
                    assert_eq!(points.len(), 4);
                    assert_eq!(points[1].x, points[2].y);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(registry.get_clip(id).unwrap(), Some(square(49.0)));
}

#[test]
fn test_cache_hit_does_not_wait_on_locked_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mesh.clips.db");
    let options = StoreOptions {
        busy: BusyPolicy::Timeout { millis: 5_000 },
        ..Default::default()
    };
    let registry = Arc::new(ClipRegistry::new(&path, OpenMode::ReadWrite, options));
    let uncached = registry.add_clip(&square(1.0)).unwrap();
    let cached = registry.add_clip(&square(2.0)).unwrap();

    let locker = Connection::open(&path).unwrap();
    locker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let loader = {
        let registry = registry.clone();
        thread::spawn(move || registry.get_clip(uncached))
    };
    // Give the miss time to block inside SQLite
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    assert_eq!(registry.get_clip(cached).unwrap(), Some(square(2.0)));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!loader.is_finished());

    locker.execute_batch("ROLLBACK").unwrap();
    assert_eq!(loader.join().unwrap().unwrap(), Some(square(1.0)));
}
