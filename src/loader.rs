use crate::prelude::*;
use crate::codec::ChunkCodec;
use crate::error::Result;
use crate::executor::{IoExecutor, TaskKey};
use crate::pending::PendingWriteCache;
use crate::region::{region_path, RegionFileCache};
use parking_lot::Mutex;

struct World<C> {
    id: u32,
    codec: C,
    regions: Arc<RegionFileCache>,
    pending: PendingWriteCache,
}
impl<C: ChunkCodec> World<C> {
    fn save_dir(&self) -> &Path {
        self.pending.save_dir()
    }
    fn key(&self, pos: ChunkPos) -> TaskKey {
        TaskKey { world: self.id, pos }
    }
    /// Checked first so looking at an unsaved area doesn't create region files for it.
    fn on_disk(&self, pos: ChunkPos) -> bool {
        region_path(self.save_dir(), pos.region(), self.regions.extension()).is_file()
    }

    fn exists(&self, pos: ChunkPos) -> bool {
        if self.pending.contains(pos) {
            return true;
        }
        if !self.on_disk(pos) {
            return false;
        }
        self.regions
            .with_region(self.save_dir(), pos, |region| region.chunk_exists(pos.local()))
            .unwrap_or_else(|e| {
                log::error!("checking for {pos:?} in {} failed: {e}", self.save_dir().display());
                false
            })
    }

    fn read(&self, pos: ChunkPos) -> Option<C::Chunk> {
        let raw: Option<Vec<u8>> = match self.pending.peek(pos) {
            Some(payload) => Some(payload.to_vec()),
            None if !self.on_disk(pos) => None,
            None => self
                .regions
                .with_region(self.save_dir(), pos, |region| region.read_chunk(pos.local()))
                .unwrap_or_else(|e| {
                    log::error!("reading {pos:?} from {} failed: {e}", self.save_dir().display());
                    None
                }),
        };
        match self.codec.decode(pos, &raw?) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                log::warn!("{}: discarding undecodable chunk {pos:?}: {e}", self.save_dir().display());
                None
            }
        }
    }

    fn encode(&self, chunk: &C::Chunk) -> Option<(ChunkPos, Arc<[u8]>)> {
        let pos = self.codec.pos(chunk);
        match self.codec.encode(chunk) {
            Ok(raw) => Some((pos, raw.into())),
            Err(e) => {
                log::error!("{}: failed to encode {pos:?}, not saving it: {e}", self.save_dir().display());
                None
            }
        }
    }
}

/// Proof of a queued [`ChunkLoader::load_chunk_async`], used to take it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadToken(SlotKey);

/// The storage engine as one world sees it.
///
/// Region files and io workers are shared; each world brings its own directory, codec
/// and pending saves. The world id comes from the region cache, so loaders opened on
/// the same directory order their io together. They don't see each other's pending
/// saves though: keep to one loader per directory.
pub struct ChunkLoader<C: ChunkCodec> {
    world: Arc<World<C>>,
    io: Arc<IoExecutor>,
    queued: Arc<Mutex<SlotMap<ChunkPos>>>,
}

impl<C: ChunkCodec> ChunkLoader<C> {
    pub fn new(save_dir: impl AsRef<Path>, codec: C, regions: Arc<RegionFileCache>, io: Arc<IoExecutor>) -> Self {
        let pending = PendingWriteCache::new(save_dir, regions.clone());
        let id = regions.world_id(pending.save_dir());
        Self {
            world: Arc::new(World { id, codec, regions, pending }),
            io,
            queued: Arc::new(Mutex::new(SlotMap::new())),
        }
    }

    pub fn save_dir(&self) -> &Path {
        self.world.save_dir()
    }
    pub fn world_id(&self) -> u32 {
        self.world.id
    }
    pub fn pending(&self) -> &PendingWriteCache {
        &self.world.pending
    }

    pub fn chunk_exists(&self, x: i32, z: i32) -> bool {
        self.world.exists(ChunkPos::new(x, z))
    }

    /// Reads a chunk on the calling thread. Absent covers both "never saved" and
    /// "unreadable"; the latter is logged.
    pub fn load_chunk_sync(&self, x: i32, z: i32) -> Option<C::Chunk> {
        let pos = ChunkPos::new(x, z);
        self.io.load_now(self.world.key(pos), || self.world.read(pos))
    }

    /// Reads a chunk on an io worker and calls `on_complete` there, unless the load is
    /// dropped with [`ChunkLoader::drop_queued_load`] before it starts.
    pub fn load_chunk_async(
        &self,
        x: i32,
        z: i32,
        on_complete: impl FnOnce(Option<C::Chunk>) + Send + 'static,
    ) -> LoadToken {
        let pos = ChunkPos::new(x, z);
        let key = self.queued.lock().insert(pos);
        let world = self.world.clone();
        let queued = self.queued.clone();
        self.io.load_later(
            move || {
                queued.lock().release(key)?;
                Some(world.read(pos))
            },
            move |loaded| match loaded {
                Some(chunk) => on_complete(chunk),
                None => log::trace!("load of {pos:?} was dropped"),
            },
        );
        LoadToken(key)
    }

    /// Takes back a load that hasn't started. Returns false if it already has, or if the
    /// token is for some other chunk.
    pub fn drop_queued_load(&self, x: i32, z: i32, token: LoadToken) -> bool {
        let mut queued = self.queued.lock();
        if queued.get(token.0) != Some(&ChunkPos::new(x, z)) {
            return false;
        }
        queued.release(token.0).is_some()
    }

    /// Queues a chunk for saving. It is readable through this loader immediately, and
    /// reaches the disk once the io workers get to it.
    pub fn save_chunk(&self, chunk: &C::Chunk) {
        let Some((pos, payload)) = self.world.encode(chunk) else { return };
        self.world.pending.put(pos, payload);
        let world = self.world.clone();
        self.io.submit_keyed(self.world.key(pos), move || {
            // failures are logged; io failures keep the payload pending for the next attempt
            let _ = world.pending.invalidate(pos);
        });
    }

    /// Saves a chunk and waits for it to hit the disk.
    pub fn save_chunk_sync(&self, chunk: &C::Chunk) -> Result<()> {
        let Some((pos, payload)) = self.world.encode(chunk) else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk could not be encoded").into());
        };
        self.world.pending.put(pos, payload);
        self.world.pending.invalidate(pos).map(drop)
    }

    pub fn adjust_worker_pool_size(&self, participants: usize) {
        self.io.adjust_for_participants(participants);
    }

    /// Periodic upkeep: closes region files nobody has touched in a while.
    pub fn tick(&self) {
        self.world.regions.evict_idle();
    }

    /// Waits for every queued save, retries any that failed, and syncs region files.
    pub fn drain_and_wait(&self) {
        self.io.drain();
        let failed = self.world.pending.drain_all();
        if failed > 0 {
            log::error!("{}: {failed} chunks could not be saved", self.save_dir().display());
        }
        self.world.regions.flush_all();
    }

    /// Drops queued loads, finishes every save and closes this world's region files.
    pub fn close(&self) {
        self.queued.lock().retain(|_, _| false);
        self.drain_and_wait();
        let closed = self.world.regions.close_dir(self.save_dir());
        log::debug!("{}: closed {closed} region files", self.save_dir().display());
    }
}
