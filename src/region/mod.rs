//! Region files: up to 1024 chunk streams packed into 4KiB sectors.
//!
//! Sector 0 holds a big-endian `offset << 8 | count` word per slot, sector 1 the time each
//! slot was last written. Streams fill the sectors after that.

use crate::prelude::*;
use crate::error::{RegionError, Result};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

pub mod cache;
pub mod sectors;
pub mod stream;

pub use cache::{canonical_dir, list_regions, region_path, RegionFileCache};
pub use sectors::{SectorMap, SectorRange};
pub use stream::{BufferPool, ChunkInput, ChunkOutput, Format};

pub const SECTOR_SIZE: usize = 4096;
pub const HEADER_SECTORS: u32 = 2;
/// The count byte of an offset word caps a stream at 255 sectors.
pub const MAX_SECTORS: u32 = 255;
pub const STREAM_HEADER: usize = 5;
const HEADER_BYTES: u64 = HEADER_SECTORS as u64 * SECTOR_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOptions {
    pub min_sectors: u32,
    pub shrink_slack: u32,
    pub compression_level: u32,
}
impl Default for RegionOptions {
    fn default() -> Self {
        Self { min_sectors: 2, shrink_slack: 2, compression_level: 4 }
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, pos)
}
#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], pos: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, pos)
}
#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut pos: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match std::os::windows::fs::FileExt::seek_read(file, buf, pos) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut pos: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match std::os::windows::fs::FileExt::seek_write(file, buf, pos) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(word)
}

fn unix_now() -> u32 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

/// Checks a stream header against the space its slot has. Returns the format and the
/// stream's total length, header included.
fn check_header(head: &[u8], capacity: usize) -> Result<(Format, usize)> {
    let len = be_u32(head, 0);
    if len == 0 || len as usize > capacity - 4 {
        return Err(RegionError::BadLength { len, capacity });
    }
    let format = Format::from_tag(head[4]).ok_or(RegionError::UnknownFormat(head[4]))?;
    Ok((format, 4 + len as usize))
}

/// In-memory mirror of the header, plus what we've learnt about each slot since opening.
struct Table {
    entries: Vec<SectorRange>,
    timestamps: Vec<u32>,
    /// Format of streams whose header has been checked since they were last written.
    verified: Vec<Option<Format>>,
    sectors: SectorMap,
}

pub struct RegionFile {
    path: PathBuf,
    file: File,
    options: RegionOptions,
    pool: Arc<BufferPool>,
    /// Every operation holds this shared; `close` takes it exclusively.
    open: RwLock<bool>,
    table: Mutex<Table>,
    slots: Box<[Mutex<()>]>,
}

impl RegionFile {
    /// Opens or creates the file at `path`. A file too short to hold the header is
    /// reset to an empty region. Header entries that can't be right (pointing
    /// into the header, past the end of the file, or at sectors another slot already
    /// claims) are dropped from the in-memory table, so those slots read as empty.
    pub fn open(path: impl Into<PathBuf>, options: RegionOptions, pool: Arc<BufferPool>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let mut len = file.metadata()?.len();
        if len < HEADER_BYTES {
            if len > 0 {
                // a torn header can't be trusted for any slot
                let err = RegionError::FileTooSmall(len);
                log::warn!("{}: {err}, starting it over", path.display());
                file.set_len(0)?;
            }
            file.set_len(HEADER_BYTES)?;
            len = HEADER_BYTES;
        }
        if len % SECTOR_SIZE as u64 != 0 {
            let padded = (len / SECTOR_SIZE as u64 + 1) * SECTOR_SIZE as u64;
            log::warn!("{}: padding {len} bytes to {padded}", path.display());
            file.set_len(padded)?;
            len = padded;
        }

        let mut header = vec![0; HEADER_BYTES as usize];
        read_at(&file, &mut header, 0)?;
        let mut table = Table {
            entries: vec![SectorRange::EMPTY; LocalPos::COUNT],
            timestamps: vec![0; LocalPos::COUNT],
            verified: vec![None; LocalPos::COUNT],
            sectors: SectorMap::new((len / SECTOR_SIZE as u64) as u32),
        };
        for slot in 0..LocalPos::COUNT {
            table.timestamps[slot] = be_u32(&header, SECTOR_SIZE + slot * 4);
            let range = SectorRange::from_raw(be_u32(&header, slot * 4));
            if range.is_empty() {
                continue;
            }
            if range.offset < HEADER_SECTORS
                || range.count == 0
                || range.end() > table.sectors.len()
                || !table.sectors.is_free(range)
            {
                let err = RegionError::IllegalRange { slot, offset: range.offset, count: range.count };
                log::warn!("{}: {err}, ignoring it", path.display());
                continue;
            }
            table.sectors.mark(range, true);
            table.entries[slot] = range;
        }
        log::debug!("opened {} ({} sectors)", path.display(), table.sectors.len());

        Ok(Self {
            path,
            file,
            options,
            pool,
            open: RwLock::new(true),
            table: Mutex::new(table),
            slots: (0..LocalPos::COUNT).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }
    /// Bounds-checks raw local coordinates.
    pub fn slot(x: i32, z: i32) -> Result<LocalPos> {
        LocalPos::new(x, z).ok_or(RegionError::OutOfBounds(x, z))
    }
    pub fn is_closed(&self) -> bool {
        !*self.open.read()
    }
    pub fn entry(&self, local: LocalPos) -> SectorRange {
        self.table.lock().entries[local.index()]
    }
    /// Unix time the slot was last written, 0 if never.
    pub fn timestamp(&self, local: LocalPos) -> u32 {
        self.table.lock().timestamps[local.index()]
    }
    /// Whether the slot was found holding a legacy stream. Cleared by the next write.
    pub fn needs_upgrade(&self, local: LocalPos) -> bool {
        matches!(self.table.lock().verified[local.index()], Some(Format::Gzip))
    }
    pub fn sector_count(&self) -> u32 {
        self.table.lock().sectors.len()
    }
    pub fn used_sectors(&self) -> u32 {
        self.table.lock().sectors.used_count()
    }

    fn ensure_open(open: &bool) -> Result<()> {
        if *open {
            Ok(())
        } else {
            Err(RegionError::Closed)
        }
    }

    /// Opens the stream stored in `local`. Corrupt streams are logged and read as absent.
    pub fn read(&self, local: LocalPos) -> Result<Option<ChunkInput>> {
        let open = self.open.read();
        Self::ensure_open(&open)?;
        let _slot = self.slots[local.index()].lock();
        let range = self.entry(local);
        if range.is_empty() {
            return Ok(None);
        }
        let mut buf = self.pool.take();
        buf.resize(range.byte_len(), 0);
        if let Err(e) = read_at(&self.file, &mut buf, range.byte_offset()) {
            self.pool.give(buf);
            return Err(e.into());
        }
        match check_header(&buf, buf.len()) {
            Ok((format, len)) => {
                self.table.lock().verified[local.index()] = Some(format);
                buf.truncate(len);
                log::trace!("{}: read {local:?}, {len} bytes {format:?}", self.path.display());
                Ok(Some(ChunkInput::new(format, buf, self.pool.clone())))
            }
            Err(err) => {
                log::warn!("{}: corrupt stream in {local:?}: {err}", self.path.display());
                self.table.lock().verified[local.index()] = None;
                self.pool.give(buf);
                Ok(None)
            }
        }
    }

    /// Reads and decompresses a whole chunk.
    pub fn read_chunk(&self, local: LocalPos) -> Result<Option<Vec<u8>>> {
        let Some(mut input) = self.read(local)? else {
            return Ok(None);
        };
        let mut raw = vec![];
        match input.read_to_end(&mut raw) {
            Ok(_) => Ok(Some(raw)),
            Err(e) if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::UnexpectedEof => {
                log::warn!("{}: {local:?} doesn't decompress: {e}", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True only when the slot holds a stream whose header checks out.
    pub fn chunk_exists(&self, local: LocalPos) -> Result<bool> {
        let open = self.open.read();
        Self::ensure_open(&open)?;
        let _slot = self.slots[local.index()].lock();
        let range = {
            let table = self.table.lock();
            let range = table.entries[local.index()];
            if range.is_empty() || table.verified[local.index()].is_some() {
                return Ok(!range.is_empty());
            }
            range
        };
        let mut head = [0; STREAM_HEADER];
        read_at(&self.file, &mut head, range.byte_offset())?;
        match check_header(&head, range.byte_len()) {
            Ok((format, _)) => {
                self.table.lock().verified[local.index()] = Some(format);
                Ok(true)
            }
            Err(err) => {
                log::warn!("{}: corrupt stream in {local:?}: {err}", self.path.display());
                Ok(false)
            }
        }
    }

    /// Starts compressing a chunk destined for `local`.
    pub fn output(&self, local: LocalPos) -> ChunkOutput<'_> {
        ChunkOutput::new(self, local, self.pool.take(), self.options.compression_level)
    }

    /// Compresses `raw` and stores it in `local`.
    pub fn write_chunk(&self, local: LocalPos, raw: &[u8]) -> Result<()> {
        let mut output = self.output(local);
        output.write_all(raw)?;
        output.finish()
    }

    /// Stores a complete stream, header included, in `local`.
    ///
    /// The stream stays where it is unless it outgrew its sectors or would leave more than
    /// `shrink_slack` of them unused. A moved stream is written to its new sectors before
    /// the header points at them, and the old ones are only released afterwards.
    pub fn write(&self, local: LocalPos, stream: &[u8]) -> Result<()> {
        let idx = local.index();
        if stream.len() < STREAM_HEADER {
            return Err(RegionError::BadLength { len: stream.len() as u32, capacity: STREAM_HEADER });
        }
        let needed = ((stream.len() + SECTOR_SIZE - 1) / SECTOR_SIZE).max(self.options.min_sectors as usize);
        if needed > MAX_SECTORS as usize {
            log::warn!("{}: {local:?} needs {needed} sectors, not saving it", self.path.display());
            return Err(RegionError::TooLarge(needed));
        }
        let needed = needed as u32;
        let format = stream.get(4).copied().and_then(Format::from_tag);

        let open = self.open.read();
        Self::ensure_open(&open)?;
        let _slot = self.slots[idx].lock();

        let (current, target) = {
            let mut table = self.table.lock();
            let current = table.entries[idx];
            if !current.is_empty() && needed <= current.count && current.count - needed <= self.options.shrink_slack {
                (current, current)
            } else {
                let target = SectorRange::new(table.sectors.find_free(needed), needed);
                if target.end() > table.sectors.len() {
                    self.file.set_len(target.end() as u64 * SECTOR_SIZE as u64)?;
                    table.sectors.grow(target.end());
                }
                table.sectors.mark(target, true);
                (current, target)
            }
        };
        let moved = current != target;

        if let Err(e) = write_at(&self.file, stream, target.byte_offset()) {
            log::error!("{}: writing {local:?} failed: {e}", self.path.display());
            let mut table = self.table.lock();
            if moved {
                table.sectors.mark(target, false);
            }
            table.verified[idx] = None;
            return Err(e.into());
        }

        let mut table = self.table.lock();
        if moved {
            if let Err(e) = write_at(&self.file, &target.to_raw().to_be_bytes(), idx as u64 * 4) {
                log::error!("{}: updating header for {local:?} failed: {e}", self.path.display());
                table.sectors.mark(target, false);
                return Err(e.into());
            }
            table.entries[idx] = target;
            if !current.is_empty() {
                table.sectors.mark(current, false);
            }
        }
        let now = unix_now();
        table.timestamps[idx] = now;
        table.verified[idx] = format;
        write_at(&self.file, &now.to_be_bytes(), (SECTOR_SIZE + idx * 4) as u64)?;
        log::trace!("{}: wrote {local:?} to {target:?}", self.path.display());
        Ok(())
    }

    /// Forgets whatever `local` holds and releases its sectors.
    pub fn delete(&self, local: LocalPos) -> Result<()> {
        let idx = local.index();
        let open = self.open.read();
        Self::ensure_open(&open)?;
        let _slot = self.slots[idx].lock();
        let mut table = self.table.lock();
        let current = table.entries[idx];
        if current.is_empty() {
            return Ok(());
        }
        write_at(&self.file, &0u32.to_be_bytes(), idx as u64 * 4)?;
        write_at(&self.file, &0u32.to_be_bytes(), (SECTOR_SIZE + idx * 4) as u64)?;
        table.entries[idx] = SectorRange::EMPTY;
        table.timestamps[idx] = 0;
        table.verified[idx] = None;
        table.sectors.mark(current, false);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let open = self.open.read();
        Self::ensure_open(&open)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Waits for in-flight reads and writes, then syncs the file. Every later operation
    /// fails with [`RegionError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.shut() {
            self.sync()?;
        }
        Ok(())
    }

    /// The first half of [`RegionFile::close`]: waits for in-flight operations and refuses
    /// any later ones. Returns false if the file was already shut.
    pub fn shut(&self) -> bool {
        let mut open = self.open.write();
        std::mem::replace(&mut *open, false)
    }

    /// Pushes everything written so far to disk. Works on a shut file too.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        log::debug!("synced {}", self.path.display());
        Ok(())
    }
}

impl Drop for RegionFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("{}: failed to sync on close: {e}", self.path.display());
        }
    }
}

impl std::fmt::Debug for RegionFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionFile")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
