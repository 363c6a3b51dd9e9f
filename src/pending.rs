use crate::prelude::*;
use crate::error::{RegionError, Result};
use crate::region::{canonical_dir, RegionFileCache};
use parking_lot::Mutex;
use std::collections::HashMap;

const FLUSH_STRIPES: usize = 64;

/// Encoded chunks that have been saved but aren't on disk yet.
///
/// `put` always replaces what's there. `invalidate` is the only way anything reaches the
/// region file: it writes the newest payload for a chunk and only then forgets it, so a
/// read that checks here first never sees older data on disk. A write that failed on io
/// leaves the payload in place for the next attempt; one the region file refuses, such
/// as a chunk too large for any slot, is dropped so reads fall back to what's on disk.
pub struct PendingWriteCache {
    save_dir: PathBuf,
    regions: Arc<RegionFileCache>,
    entries: Mutex<HashMap<ChunkPos, Arc<[u8]>>>,
    // Serializes write-backs of the same chunk, so a slow older write can't land last.
    flushing: Box<[Mutex<()>]>,
}

impl PendingWriteCache {
    /// `save_dir` is resolved to its canonical form, creating it if needed.
    pub fn new(save_dir: impl AsRef<Path>, regions: Arc<RegionFileCache>) -> Self {
        Self {
            save_dir: canonical_dir(save_dir.as_ref()),
            regions,
            entries: Mutex::new(HashMap::new()),
            flushing: (0..FLUSH_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }
    pub fn put(&self, pos: ChunkPos, payload: impl Into<Arc<[u8]>>) {
        self.entries.lock().insert(pos, payload.into());
    }
    pub fn peek(&self, pos: ChunkPos) -> Option<Arc<[u8]>> {
        self.entries.lock().get(&pos).cloned()
    }
    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.entries.lock().contains_key(&pos)
    }
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stripe(pos: ChunkPos) -> usize {
        (pos.x as u32).wrapping_mul(0x9E37_79B9).wrapping_add(pos.z as u32) as usize % FLUSH_STRIPES
    }

    /// Writes the pending payload for `pos` to its region file, on this thread. Returns
    /// whether anything was pending.
    pub fn invalidate(&self, pos: ChunkPos) -> Result<bool> {
        let _flushing = self.flushing[Self::stripe(pos)].lock();
        let Some(payload) = self.peek(pos) else {
            return Ok(false);
        };
        let local = pos.local();
        let written = self
            .regions
            .with_region(&self.save_dir, pos, |region| region.write_chunk(local, &payload));
        match written {
            Ok(()) => {
                self.forget(pos, &payload);
                Ok(true)
            }
            Err(err) if Self::retryable(&err) => {
                log::error!("saving chunk {pos:?} in {} failed, keeping it pending: {err}", self.save_dir.display());
                Err(err)
            }
            Err(err) => {
                log::error!("{}: chunk {pos:?} can't be stored, dropping the save: {err}", self.save_dir.display());
                self.forget(pos, &payload);
                Err(err)
            }
        }
    }

    /// Whether trying the same write again could work. A payload the region file rejects
    /// outright would be rejected forever.
    fn retryable(err: &RegionError) -> bool {
        !matches!(err, RegionError::TooLarge(_) | RegionError::OutOfBounds(..)) && !err.is_corruption()
    }

    fn forget(&self, pos: ChunkPos, payload: &Arc<[u8]>) {
        let mut entries = self.entries.lock();
        // a newer save may have come in while we were writing; that one stays
        if entries.get(&pos).map_or(false, |p| Arc::ptr_eq(p, payload)) {
            entries.remove(&pos);
        }
    }

    /// Invalidates every pending chunk. Returns how many writes failed.
    pub fn drain_all(&self) -> usize {
        let pending: Vec<ChunkPos> = self.entries.lock().keys().copied().collect();
        pending.into_iter().filter(|pos| self.invalidate(*pos).is_err()).count()
    }
}
