//! Compressed chunk streams and the buffers behind them.
//!
//! A stream on disk is `[len: u32 BE][format: u8][payload]`, where `len` counts the format
//! byte and the payload. Writers always produce [`Format::Deflate`].

use crate::prelude::*;
use crate::error::Result;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::io::{Cursor, Read, Write};

use super::{RegionFile, SECTOR_SIZE, STREAM_HEADER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    /// Legacy streams, read only.
    Gzip = 1,
    /// zlib-wrapped deflate, what everything is written as.
    Deflate = 2,
    /// Stored without compression, read only.
    Raw = 3,
}
impl Format {
    pub const CURRENT: Self = Self::Deflate;

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Gzip),
            2 => Some(Self::Deflate),
            3 => Some(Self::Raw),
            _ => None,
        }
    }
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Recycles the byte buffers streams are assembled in, so steady-state saving and loading
/// doesn't allocate.
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
}
impl BufferPool {
    pub const MAX_IDLE: usize = 32;
    const INITIAL_CAPACITY: usize = 2 * SECTOR_SIZE;

    pub fn new() -> Self {
        Self::default()
    }
    pub fn take(&self) -> Vec<u8> {
        self.idle.lock().pop().unwrap_or_else(|| Vec::with_capacity(Self::INITIAL_CAPACITY))
    }
    pub fn give(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < Self::MAX_IDLE {
            idle.push(buf);
        }
    }
    /// Buffers waiting to be reused.
    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compresses a chunk into a pooled buffer. Nothing reaches the region file until
/// [`ChunkOutput::finish`].
pub struct ChunkOutput<'a> {
    region: &'a RegionFile,
    local: LocalPos,
    encoder: ZlibEncoder<Vec<u8>>,
}
impl<'a> ChunkOutput<'a> {
    pub(super) fn new(region: &'a RegionFile, local: LocalPos, mut buf: Vec<u8>, level: u32) -> Self {
        buf.extend_from_slice(&[0; STREAM_HEADER]);
        Self {
            region,
            local,
            encoder: ZlibEncoder::new(buf, Compression::new(level)),
        }
    }
    /// Fills in the stream header and writes the stream into its slot.
    pub fn finish(self) -> Result<()> {
        let mut buf = self.encoder.finish()?;
        let len = (buf.len() - 4) as u32;
        buf[..4].copy_from_slice(&len.to_be_bytes());
        buf[4] = Format::CURRENT.tag();
        let written = self.region.write(self.local, &buf);
        self.region.pool().give(buf);
        written
    }
}
impl Write for ChunkOutput<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

enum Decoder {
    Deflate(ZlibDecoder<Cursor<Vec<u8>>>),
    Gzip(GzDecoder<Cursor<Vec<u8>>>),
    Raw(Cursor<Vec<u8>>),
}

/// Decompressing reader over one stream. Hands its buffer back to the pool when dropped.
pub struct ChunkInput {
    format: Format,
    decoder: Option<Decoder>,
    pool: Arc<BufferPool>,
}
impl ChunkInput {
    /// `buf` holds the whole stream including its header, trimmed to the stream's length.
    pub(super) fn new(format: Format, buf: Vec<u8>, pool: Arc<BufferPool>) -> Self {
        let mut payload = Cursor::new(buf);
        payload.set_position(STREAM_HEADER as u64);
        let decoder = match format {
            Format::Deflate => Decoder::Deflate(ZlibDecoder::new(payload)),
            Format::Gzip => Decoder::Gzip(GzDecoder::new(payload)),
            Format::Raw => Decoder::Raw(payload),
        };
        Self { format, decoder: Some(decoder), pool }
    }
    pub fn format(&self) -> Format {
        self.format
    }
}
impl Read for ChunkInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.decoder {
            Some(Decoder::Deflate(d)) => d.read(buf),
            Some(Decoder::Gzip(d)) => d.read(buf),
            Some(Decoder::Raw(d)) => d.read(buf),
            None => Ok(0),
        }
    }
}
impl Drop for ChunkInput {
    fn drop(&mut self) {
        // legacy streams go through flate2's generic gzip path; their buffers aren't worth keeping
        match self.decoder.take() {
            Some(Decoder::Deflate(d)) => self.pool.give(d.into_inner().into_inner()),
            Some(Decoder::Raw(d)) => self.pool.give(d.into_inner()),
            Some(Decoder::Gzip(_)) | None => {}
        }
    }
}
