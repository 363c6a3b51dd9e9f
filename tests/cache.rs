use mcstore::region::{list_regions, region_path, RegionOptions};
use mcstore::{ChunkPos, RegionError, RegionFileCache, RegionPos, StorageConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn cache(capacity: usize) -> RegionFileCache {
    RegionFileCache::with_options(capacity, Duration::from_secs(300), RegionOptions::default(), "mca")
}

#[test]
fn files_land_under_region() {
    let dir = TempDir::new().unwrap();
    let cache = cache(4);
    let region = cache.get_or_load(dir.path(), ChunkPos::new(-1, 40)).unwrap();
    assert_eq!(region.path(), dir.path().join("region").join("r.-1.1.mca"));
    assert_eq!(region.path(), region_path(dir.path(), RegionPos::new(-1, 1), "mca"));
    assert!(region.path().is_file());

    // same region, same handle
    let again = cache.get_or_load(dir.path(), ChunkPos::new(-32, 63)).unwrap();
    assert!(Arc::ptr_eq(&region, &again));
    assert_eq!(cache.len(), 1);
}

#[test]
fn eviction_closes_handles() {
    let dir = TempDir::new().unwrap();
    let cache = cache(2);
    let pos = ChunkPos::new(0, 0);
    let first = cache.get_or_load(dir.path(), pos).unwrap();
    first.write_chunk(pos.local(), b"before eviction").unwrap();

    cache.get_or_load(dir.path(), ChunkPos::new(32, 0)).unwrap();
    cache.get_or_load(dir.path(), ChunkPos::new(64, 0)).unwrap();
    assert_eq!(cache.len(), 2);

    assert!(first.is_closed());
    assert!(matches!(first.write_chunk(pos.local(), b"through a stale handle"), Err(RegionError::Closed)));
    assert!(matches!(first.read(pos.local()), Err(RegionError::Closed)));

    let fresh = cache.get_or_load(dir.path(), pos).unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(fresh.read_chunk(pos.local()).unwrap().unwrap(), b"before eviction");
}

#[test]
fn recently_used_survives() {
    let dir = TempDir::new().unwrap();
    let cache = cache(2);
    let a = cache.get_or_load(dir.path(), ChunkPos::new(0, 0)).unwrap();
    let b = cache.get_or_load(dir.path(), ChunkPos::new(32, 0)).unwrap();
    cache.get_or_load(dir.path(), ChunkPos::new(0, 0)).unwrap();
    cache.get_or_load(dir.path(), ChunkPos::new(64, 0)).unwrap();
    assert!(!a.is_closed());
    assert!(b.is_closed());
}

#[test]
fn with_region_reopens_after_eviction() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(cache(1));
    let pos = ChunkPos::new(5, 5);
    let mut calls = 0;
    cache
        .with_region(dir.path(), pos, |region| {
            calls += 1;
            if calls == 1 {
                // another world steals the only slot while we hold the handle
                cache.get_or_load(dir.path(), ChunkPos::new(100, 100))?;
            }
            region.write_chunk(pos.local(), b"retried")
        })
        .unwrap();
    assert_eq!(calls, 2);
    let read = cache.with_region(dir.path(), pos, |region| region.read_chunk(pos.local())).unwrap();
    assert_eq!(read.unwrap(), b"retried");
}

#[test]
fn idle_files_are_closed() {
    let dir = TempDir::new().unwrap();
    let cache = RegionFileCache::with_options(8, Duration::ZERO, RegionOptions::default(), "mca");
    let region = cache.get_or_load(dir.path(), ChunkPos::new(0, 0)).unwrap();
    assert_eq!(cache.evict_idle(), 1);
    assert!(region.is_closed());
    assert!(cache.is_empty());

    let patient = RegionFileCache::with_options(8, Duration::from_secs(3600), RegionOptions::default(), "mca");
    patient.get_or_load(dir.path(), ChunkPos::new(0, 0)).unwrap();
    assert_eq!(patient.evict_idle(), 0);
    assert_eq!(patient.len(), 1);
}

#[test]
fn worlds_are_closed_separately() {
    let overworld = TempDir::new().unwrap();
    let nether = TempDir::new().unwrap();
    let cache = RegionFileCache::new(&StorageConfig::default());
    let a = cache.get_or_load(overworld.path(), ChunkPos::new(0, 0)).unwrap();
    let b = cache.get_or_load(nether.path(), ChunkPos::new(0, 0)).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));

    assert_eq!(cache.close_dir(nether.path()), 1);
    assert!(b.is_closed());
    assert!(!a.is_closed());

    cache.close_all();
    assert!(a.is_closed());
    assert!(cache.is_empty());
}

#[test]
fn lists_region_files() {
    let dir = TempDir::new().unwrap();
    assert!(list_regions(dir.path(), "mca").unwrap().is_empty());
    let cache = cache(8);
    for pos in [ChunkPos::new(0, 0), ChunkPos::new(-1, 0), ChunkPos::new(40, -70)] {
        cache.get_or_load(dir.path(), pos).unwrap();
    }
    std::fs::write(dir.path().join("region").join("r.0.0.mcr"), b"").unwrap();
    std::fs::write(dir.path().join("region").join("notes.txt"), b"").unwrap();
    assert_eq!(
        list_regions(dir.path(), "mca").unwrap(),
        vec![RegionPos::new(-1, 0), RegionPos::new(0, 0), RegionPos::new(1, -3)]
    );
}

#[test]
fn concurrent_lookups_share_handles() {
    let dir = TempDir::new().unwrap();
    let cache = cache(3);
    std::thread::scope(|s| {
        for t in 0..6 {
            let cache = &cache;
            let dir = dir.path();
            s.spawn(move || {
                for i in 0..64 {
                    let pos = ChunkPos::new((i % 5) * 32 + t, i);
                    let payload = format!("{t}:{i}");
                    cache
                        .with_region(dir, pos, |region| region.write_chunk(pos.local(), payload.as_bytes()))
                        .unwrap();
                }
            });
        }
    });
    assert!(cache.len() <= 3);
    for t in 0..6 {
        for i in 0..64 {
            let pos = ChunkPos::new((i % 5) * 32 + t, i);
            let read = cache.with_region(dir.path(), pos, |region| region.read_chunk(pos.local())).unwrap();
            assert_eq!(read.unwrap(), format!("{t}:{i}").as_bytes());
        }
    }
}
