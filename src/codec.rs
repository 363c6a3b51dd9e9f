//! Turning chunks into the bytes a region file stores, and back.
//!
//! The storage engine never looks inside a payload. It only needs to know which chunk a
//! value is for, and how to get bytes out of it and back in.

use crate::prelude::*;
use fastnbt::Value;
use serde::{Deserialize, Serialize};

pub trait ChunkCodec: Send + Sync + 'static {
    type Chunk: Send + 'static;

    fn pos(&self, chunk: &Self::Chunk) -> ChunkPos;
    fn encode(&self, chunk: &Self::Chunk) -> io::Result<Vec<u8>>;
    /// `pos` is where the payload was found, which the decoded chunk should agree with.
    fn decode(&self, pos: ChunkPos, raw: &[u8]) -> io::Result<Self::Chunk>;
}

/// A scheduled block update, stored next to the chunk it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileTick {
    #[serde(rename = "i")]
    pub block: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    #[serde(rename = "t")]
    pub delay: i32,
    #[serde(rename = "p")]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NbtChunk {
    #[serde(rename = "xPos")]
    pub x: i32,
    #[serde(rename = "zPos")]
    pub z: i32,
    #[serde(rename = "LastUpdate", default)]
    pub last_update: i64,
    #[serde(rename = "Sections", default)]
    pub sections: Vec<Value>,
    #[serde(rename = "TileTicks", default, skip_serializing_if = "Vec::is_empty")]
    pub tile_ticks: Vec<TileTick>,
}
impl NbtChunk {
    pub fn empty(pos: ChunkPos) -> Self {
        Self { x: pos.x, z: pos.z, last_update: 0, sections: vec![], tile_ticks: vec![] }
    }
    pub fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }
}

#[derive(Serialize, Deserialize)]
struct Root<L> {
    #[serde(rename = "DataVersion", default)]
    data_version: i32,
    #[serde(rename = "Level")]
    level: L,
}

type PendingTicks = Box<dyn Fn(ChunkPos) -> Vec<TileTick> + Send + Sync>;

/// Stores [`NbtChunk`]s as uncompressed NBT, `{DataVersion, Level: {...}}`.
pub struct NbtCodec {
    data_version: i32,
    pending_ticks: Option<PendingTicks>,
}
impl NbtCodec {
    pub fn new(data_version: i32) -> Self {
        Self { data_version, pending_ticks: None }
    }
    /// Asks `ticks` for the block updates the world still has scheduled in a chunk every
    /// time one is saved. They're stored with it, after the chunk's own.
    pub fn with_pending_ticks(mut self, ticks: impl Fn(ChunkPos) -> Vec<TileTick> + Send + Sync + 'static) -> Self {
        self.pending_ticks = Some(Box::new(ticks));
        self
    }
}

fn invalid(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl ChunkCodec for NbtCodec {
    type Chunk = NbtChunk;

    fn pos(&self, chunk: &NbtChunk) -> ChunkPos {
        chunk.pos()
    }

    fn encode(&self, chunk: &NbtChunk) -> io::Result<Vec<u8>> {
        let extra = self.pending_ticks.as_ref().map(|f| f(chunk.pos())).unwrap_or_default();
        if extra.is_empty() {
            return fastnbt::to_bytes(&Root { data_version: self.data_version, level: chunk }).map_err(invalid);
        }
        let mut level = chunk.clone();
        level.tile_ticks.extend(extra);
        fastnbt::to_bytes(&Root { data_version: self.data_version, level }).map_err(invalid)
    }

    fn decode(&self, pos: ChunkPos, raw: &[u8]) -> io::Result<NbtChunk> {
        let root: Root<NbtChunk> = fastnbt::from_bytes(raw).map_err(invalid)?;
        if root.level.pos() != pos {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk stored at {pos:?} says it is {:?}", root.level.pos()),
            ));
        }
        if root.data_version > self.data_version {
            log::warn!("{pos:?} was saved by a newer version ({} > {})", root.data_version, self.data_version);
        }
        Ok(root.level)
    }
}
