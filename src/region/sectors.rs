use super::{HEADER_SECTORS, SECTOR_SIZE};

/// A run of sectors, as stored in the offset table: `offset << 8 | count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectorRange {
    pub offset: u32,
    pub count: u32,
}
impl SectorRange {
    pub const EMPTY: Self = Self { offset: 0, count: 0 };

    pub const fn new(offset: u32, count: u32) -> Self {
        Self { offset, count }
    }
    pub fn from_raw(word: u32) -> Self {
        Self { offset: word >> 8, count: word & 0xFF }
    }
    pub fn to_raw(self) -> u32 {
        self.offset << 8 | self.count & 0xFF
    }
    /// Offset 0 is the header, so it doubles as "nothing stored".
    pub fn is_empty(self) -> bool {
        self.offset == 0
    }
    pub fn end(self) -> u32 {
        self.offset + self.count
    }
    pub fn byte_offset(self) -> u64 {
        self.offset as u64 * SECTOR_SIZE as u64
    }
    pub fn byte_len(self) -> usize {
        self.count as usize * SECTOR_SIZE
    }
    pub fn overlaps(self, other: Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.offset < other.end() && other.offset < self.end()
    }
}

/// Which sectors of a region file are claimed, one bit each.
#[derive(Debug, Clone)]
pub struct SectorMap {
    used: Vec<u64>,
    len: u32,
}
impl SectorMap {
    /// A map for a file of `len` sectors, with the header already claimed.
    pub fn new(len: u32) -> Self {
        let mut map = Self { used: vec![], len: 0 };
        map.grow(len.max(HEADER_SECTORS));
        map.mark(SectorRange::new(0, HEADER_SECTORS), true);
        map
    }
    /// Sectors in the file.
    pub fn len(&self) -> u32 {
        self.len
    }
    pub fn grow(&mut self, len: u32) {
        if len > self.len {
            self.len = len;
            self.used.resize((len as usize + 63) / 64, 0);
        }
    }
    pub fn is_used(&self, sector: u32) -> bool {
        self.used.get(sector as usize / 64).map_or(false, |word| word & 1u64 << (sector % 64) != 0)
    }
    pub fn is_free(&self, range: SectorRange) -> bool {
        (range.offset..range.end()).all(|sector| !self.is_used(sector))
    }
    pub fn mark(&mut self, range: SectorRange, used: bool) {
        debug_assert!(range.end() <= self.len, "marking {range:?} past {} sectors", self.len);
        for sector in range.offset..range.end().min(self.len) {
            let word = &mut self.used[sector as usize / 64];
            if used {
                *word |= 1u64 << (sector % 64);
            } else {
                *word &= !(1u64 << (sector % 64));
            }
        }
    }
    /// First run of `count` free sectors after the header, or `len()` when the run has
    /// to be appended.
    pub fn find_free(&self, count: u32) -> u32 {
        let mut start = HEADER_SECTORS;
        let mut run = 0;
        for sector in HEADER_SECTORS..self.len {
            if self.is_used(sector) {
                start = sector + 1;
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return start;
                }
            }
        }
        self.len
    }
    pub fn used_count(&self) -> u32 {
        self.used.iter().map(|word| word.count_ones()).sum()
    }
}
