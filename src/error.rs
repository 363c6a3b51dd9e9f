use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("region file is {0} bytes, too short for the two header sectors")]
    FileTooSmall(u64),
    #[error("({0}, {1}) is outside the 32x32 slot grid")]
    OutOfBounds(i32, i32),
    #[error("slot {slot} claims sectors {offset}+{count}, outside the file or overlapping another slot")]
    IllegalRange { slot: usize, offset: u32, count: u32 },
    #[error("stream length {len} does not fit in {capacity} bytes")]
    BadLength { len: u32, capacity: usize },
    #[error("unknown stream format {0}")]
    UnknownFormat(u8),
    #[error("stream needs {0} sectors, more than a slot can address")]
    TooLarge(usize),
    #[error("region file is closed")]
    Closed,
}
impl RegionError {
    /// Bad bytes on disk, as opposed to a failure to reach them.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::IllegalRange { .. } | Self::BadLength { .. } | Self::UnknownFormat(_))
            || matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::InvalidData)
    }
}

pub type Result<T> = std::result::Result<T, RegionError>;
