mod collections;
pub mod types;
pub mod error;
pub mod config;
pub mod region;
pub mod pending;
pub mod executor;
pub mod codec;
pub mod loader;

pub use config::StorageConfig;
pub use error::RegionError;
pub use executor::{IoExecutor, TaskKey};
pub use loader::{ChunkLoader, LoadToken};
pub use pending::PendingWriteCache;
pub use region::{RegionFile, RegionFileCache};
pub use types::{ChunkPos, LocalPos, RegionPos};

mod prelude {
    pub(crate) use crate::collections::*;
    pub(crate) use crate::types::*;
    pub(crate) use std::{io, time};
    pub(crate) use std::path::{Path, PathBuf};
    pub(crate) use std::sync::Arc;
}

/// Who is allowed to touch the disk?
///
/// The simulation thread must never wait on a save. It hands finished chunks to the
/// pending cache and moves on; the executor owns the actual writes.
///
/// Loads are the awkward part. A player walking into unloaded terrain needs the chunk
/// *this tick*, so `load_chunk_sync` runs on the caller. Everything else (prefetching,
/// view distance growth) goes through `load_chunk_async` and may be dropped before it
/// starts if the player turns around.
///
/// Where can a chunk live?
///   - only in memory (the world owns it, nothing pending)
///   - in the pending cache, encoded, not yet durable
///   - on disk, in a region file
/// A read consults them in that order. The pending cache always holds the newest
/// encoding, so a read never sees disk contents older than what was last saved.
///
/// What happens when a write fails?
///   The payload stays pending. The next save of that chunk replaces it, and
///   `drain_and_wait` retries whatever is left. There's no point in throwing it away:
///   the world would silently revert on next load.
///
/// Region files are shared between every world in the process, keyed by save directory.
/// The cache keeps a bounded number open; eviction closes the file first, so nothing
/// holding an old handle can write through it afterwards. Those callers reopen.
#[allow(dead_code, non_camel_case_types)]
struct storage;
