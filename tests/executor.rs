use mcstore::region::RegionOptions;
use mcstore::{ChunkPos, IoExecutor, PendingWriteCache, RegionFileCache, StorageConfig, TaskKey};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn key(x: i32) -> TaskKey {
    TaskKey { world: 0, pos: ChunkPos::new(x, 0) }
}

#[test]
fn drain_waits_for_everything() {
    let io = IoExecutor::with_workers(4);
    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..200 {
        let done = done.clone();
        io.submit(move || {
            if i % 10 == 0 {
                std::thread::sleep(Duration::from_millis(2));
            }
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    io.drain();
    assert_eq!(io.outstanding(), 0);
    assert_eq!(done.load(Ordering::SeqCst), 200);
}

#[test]
fn same_key_runs_in_order_one_at_a_time() {
    let io = IoExecutor::with_workers(8);
    let log: Arc<Mutex<Vec<Vec<usize>>>> = Arc::new(Mutex::new(vec![vec![]; 4]));
    let running: Arc<Vec<AtomicBool>> = Arc::new((0..4).map(|_| AtomicBool::new(false)).collect());
    for i in 0..100 {
        let k = i % 4;
        let log = log.clone();
        let running = running.clone();
        io.submit_keyed(key(k as i32), move || {
            assert!(!running[k].swap(true, Ordering::SeqCst), "two tasks for key {k} at once");
            std::thread::sleep(Duration::from_micros(200));
            log.lock().unwrap()[k].push(i);
            running[k].store(false, Ordering::SeqCst);
        });
    }
    io.drain();
    let log = log.lock().unwrap();
    for (k, seen) in log.iter().enumerate() {
        let expected: Vec<usize> = (0..100).filter(|i| i % 4 == k).collect();
        assert_eq!(seen, &expected);
    }
}

#[test]
fn later_save_wins() {
    let dir = TempDir::new().unwrap();
    let regions = Arc::new(RegionFileCache::with_options(
        16,
        Duration::from_secs(300),
        RegionOptions::default(),
        "mca",
    ));
    let pending = Arc::new(PendingWriteCache::new(dir.path(), regions.clone()));
    let io = IoExecutor::with_workers(4);
    let pos = ChunkPos::new(3, 4);

    for payload in [&b"v1"[..], b"v2"] {
        pending.put(pos, payload);
        let pending = pending.clone();
        io.submit_keyed(TaskKey { world: 0, pos }, move || {
            pending.invalidate(pos).unwrap();
        });
    }
    io.drain();

    assert!(pending.is_empty());
    let stored = regions
        .with_region(pending.save_dir(), pos, |region| region.read_chunk(pos.local()))
        .unwrap();
    assert_eq!(stored.unwrap(), b"v2");
}

#[test]
fn panics_are_contained() {
    let io = IoExecutor::with_workers(1);
    io.submit(|| panic!("boom"));
    io.submit_keyed(key(0), || panic!("keyed boom"));
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    io.submit_keyed(key(0), move || flag.store(true, Ordering::SeqCst));
    io.drain();
    assert_eq!(io.outstanding(), 0);
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn resizing_keeps_queued_work() {
    let io = IoExecutor::new(&StorageConfig { base_workers: 2, max_workers: 6, ..StorageConfig::default() });
    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..300 {
        if i == 100 {
            io.resize(1);
        }
        if i == 200 {
            io.resize(6);
        }
        let done = done.clone();
        io.submit_keyed(key(i % 7), move || {
            std::thread::sleep(Duration::from_micros(100));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    io.drain();
    assert_eq!(done.load(Ordering::SeqCst), 300);
    assert_eq!(io.workers(), 6);
}

#[test]
fn pool_follows_participants() {
    let io = IoExecutor::new(&StorageConfig {
        base_workers: 1,
        max_workers: 4,
        participants_per_worker: 8,
        ..StorageConfig::default()
    });
    assert_eq!(io.workers(), 1);
    io.adjust_for_participants(20);
    assert_eq!(io.workers(), 3);
    io.adjust_for_participants(1000);
    assert_eq!(io.workers(), 4);
    io.adjust_for_participants(0);
    assert_eq!(io.workers(), 1);
}

#[test]
fn loads_now_and_later() {
    let io = IoExecutor::with_workers(2);
    let here = std::thread::current().id();
    assert_eq!(io.load_now(key(0), || std::thread::current().id()), here);

    let seen = Arc::new(Mutex::new(None));
    let out = seen.clone();
    io.load_later(
        || 41 + 1,
        move |value| {
            let name = std::thread::current().name().map(str::to_owned);
            *out.lock().unwrap() = Some((value, name));
        },
    );
    io.drain();
    let (value, name) = seen.lock().unwrap().take().unwrap();
    assert_eq!(value, 42);
    assert!(name.unwrap().starts_with("chunk-io-"));
}

#[test]
fn shutdown_finishes_queued_work() {
    let done = Arc::new(AtomicUsize::new(0));
    {
        let io = IoExecutor::with_workers(2);
        for _ in 0..50 {
            let done = done.clone();
            io.submit(move || {
                std::thread::sleep(Duration::from_micros(200));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(done.load(Ordering::SeqCst), 50);
}
