use crate::prelude::*;
use crate::config::StorageConfig;
use crate::error::{RegionError, Result};
use hashlink::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{BufferPool, RegionFile, RegionOptions};

/// `<save_dir>/region/r.<x>.<z>.<ext>`
pub fn region_path(save_dir: &Path, pos: RegionPos, extension: &str) -> PathBuf {
    save_dir.join("region").join(format!("r.{}.{}.{extension}", pos.x, pos.z))
}

/// The form of `save_dir` the cache keys on, so two spellings of one directory share
/// region files. Creates the directory if needed.
pub fn canonical_dir(save_dir: &Path) -> PathBuf {
    let canonical = std::fs::create_dir_all(save_dir).and_then(|()| save_dir.canonicalize());
    canonical.unwrap_or_else(|e| {
        log::warn!("can't resolve {}, using it as given: {e}", save_dir.display());
        save_dir.to_path_buf()
    })
}

/// Region files present under `save_dir`. A world that never saved has none.
pub fn list_regions(save_dir: &Path, extension: &str) -> io::Result<Vec<RegionPos>> {
    let dir = match std::fs::read_dir(save_dir.join("region")) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };
    let mut regions = vec![];
    for entry in dir {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let mut parts = name.split('.');
        let parsed = match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("r"), Some(x), Some(z), Some(ext), None) if ext == extension => {
                x.parse().ok().zip(z.parse().ok())
            }
            _ => None,
        };
        if let Some((x, z)) = parsed {
            regions.push(RegionPos::new(x, z));
        }
    }
    regions.sort();
    Ok(regions)
}

type Key = (PathBuf, RegionPos);

/// Eviction can race a lookup; past this many lost races something is closing files in a loop.
const REOPEN_ATTEMPTS: u32 = 8;

struct Entry {
    file: Arc<RegionFile>,
    last_used: time::Instant,
}

/// Open region files, shared by every world in the process.
///
/// At most `capacity` files stay open; opening another closes the least recently used.
/// Files untouched for `idle` are closed by [`RegionFileCache::evict_idle`]. Either way
/// the file is shut before it leaves the index, and since lookups go through the same
/// lock, no lookup hands out a closed file. Syncing evicted files to disk happens after
/// the lock is released.
pub struct RegionFileCache {
    index: Mutex<LruCache<Key, Entry>>,
    capacity: usize,
    idle: time::Duration,
    options: RegionOptions,
    extension: String,
    pool: Arc<BufferPool>,
    worlds: Mutex<HashMap<PathBuf, u32>>,
}

impl RegionFileCache {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_options(config.region_cache_capacity, config.region_idle(), config.region_options(), &config.extension)
    }
    pub fn with_options(capacity: usize, idle: time::Duration, options: RegionOptions, extension: &str) -> Self {
        Self {
            index: Mutex::new(LruCache::new(usize::MAX)),
            capacity: capacity.max(1),
            idle,
            options,
            extension: extension.to_owned(),
            pool: Arc::new(BufferPool::new()),
            worlds: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
    pub fn extension(&self) -> &str {
        &self.extension
    }
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A stable id for the world saved in `save_dir`, the same for every caller naming
    /// that directory.
    pub fn world_id(&self, save_dir: &Path) -> u32 {
        let mut worlds = self.worlds.lock();
        let next = worlds.len() as u32;
        *worlds.entry(save_dir.to_path_buf()).or_insert(next)
    }

    /// The region file holding `chunk`, opening (and creating) it if needed.
    pub fn get_or_load(&self, save_dir: &Path, chunk: ChunkPos) -> Result<Arc<RegionFile>> {
        let key = (save_dir.to_path_buf(), chunk.region());
        let mut evicted = vec![];
        let loaded = {
            let mut index = self.index.lock();
            if let Some(entry) = index.get_mut(&key) {
                entry.last_used = time::Instant::now();
                return Ok(entry.file.clone());
            }
            while index.len() >= self.capacity {
                let Some(lru) = index.iter().next().map(|(key, _)| key.clone()) else { break };
                evicted.extend(Self::evict(&mut index, &lru));
            }
            self.open(&mut index, key)
        };
        Self::sync(evicted);
        loaded
    }

    fn open(&self, index: &mut LruCache<Key, Entry>, key: Key) -> Result<Arc<RegionFile>> {
        let path = region_path(&key.0, key.1, &self.extension);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = Arc::new(RegionFile::open(path, self.options, self.pool.clone())?);
        index.insert(key, Entry { file: file.clone(), last_used: time::Instant::now() });
        Ok(file)
    }

    /// Runs `f` against the region file holding `chunk`. A file closed underneath us is
    /// reopened and `f` retried.
    pub fn with_region<T>(&self, save_dir: &Path, chunk: ChunkPos, mut f: impl FnMut(&RegionFile) -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            let region = self.get_or_load(save_dir, chunk)?;
            attempts += 1;
            match f(&region) {
                Err(RegionError::Closed) if attempts < REOPEN_ATTEMPTS => {
                    log::debug!("{} closed mid-operation, reopening", region.path().display());
                }
                res => return res,
            }
        }
    }

    /// Shuts the file and drops it from the index. The caller syncs it once the index is
    /// unlocked.
    fn evict(index: &mut LruCache<Key, Entry>, key: &Key) -> Option<Arc<RegionFile>> {
        let file = index.get(key)?.file.clone();
        file.shut();
        index.remove(key);
        Some(file)
    }

    fn sync(evicted: Vec<Arc<RegionFile>>) {
        for file in evicted {
            if let Err(e) = file.sync() {
                log::error!("failed to sync {}: {e}", file.path().display());
            }
        }
    }

    /// Closes files that haven't been used for the idle period.
    pub fn evict_idle(&self) -> usize {
        let now = time::Instant::now();
        let mut evicted = vec![];
        {
            let mut index = self.index.lock();
            // least recently used first, so the expired ones are all at the front
            loop {
                let Some(key) = index
                    .iter()
                    .next()
                    .filter(|(_, entry)| now.duration_since(entry.last_used) >= self.idle)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                evicted.extend(Self::evict(&mut index, &key));
            }
        }
        let count = evicted.len();
        if count > 0 {
            log::debug!("closed {count} idle region files");
        }
        Self::sync(evicted);
        count
    }

    /// Closes every file belonging to one world.
    pub fn close_dir(&self, save_dir: &Path) -> usize {
        let evicted: Vec<_> = {
            let mut index = self.index.lock();
            let keys: Vec<Key> = index.iter().filter(|(key, _)| key.0 == save_dir).map(|(key, _)| key.clone()).collect();
            keys.iter().filter_map(|key| Self::evict(&mut index, key)).collect()
        };
        let count = evicted.len();
        Self::sync(evicted);
        count
    }

    /// Closes everything. Outstanding io should have been drained first.
    pub fn close_all(&self) {
        let mut evicted = vec![];
        {
            let mut index = self.index.lock();
            loop {
                let Some(key) = index.iter().next().map(|(key, _)| key.clone()) else { break };
                evicted.extend(Self::evict(&mut index, &key));
            }
        }
        Self::sync(evicted);
    }

    /// Syncs every open file without closing it.
    pub fn flush_all(&self) {
        let files: Vec<Arc<RegionFile>> = self.index.lock().iter().map(|(_, entry)| entry.file.clone()).collect();
        for file in files {
            match file.flush() {
                // evicted meanwhile, and synced by whoever evicted it
                Ok(()) | Err(RegionError::Closed) => {}
                Err(e) => log::error!("failed to flush {}: {e}", file.path().display()),
            }
        }
    }
}

impl Drop for RegionFileCache {
    fn drop(&mut self) {
        self.close_all();
    }
}
