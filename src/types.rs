/// Chunk coordinates, in units of 16 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}
impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
    pub fn region(self) -> RegionPos {
        RegionPos { x: self.x >> 5, z: self.z >> 5 }
    }
    pub fn local(self) -> LocalPos {
        LocalPos { x: (self.x & 31) as u8, z: (self.z & 31) as u8 }
    }
}

/// Identifies one region file, covering 32x32 chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}
impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
    pub fn chunk(self, local: LocalPos) -> ChunkPos {
        ChunkPos { x: self.x << 5 | local.x as i32, z: self.z << 5 | local.z as i32 }
    }
}

/// One of the 1024 slots of a region file. Always in `0..32` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalPos {
    x: u8,
    z: u8,
}
impl LocalPos {
    pub const COUNT: usize = 32 * 32;

    pub fn new(x: i32, z: i32) -> Option<Self> {
        ((0..32).contains(&x) && (0..32).contains(&z)).then(|| Self { x: x as u8, z: z as u8 })
    }
    pub fn from_index(idx: usize) -> Option<Self> {
        (idx < Self::COUNT).then(|| Self { x: (idx & 31) as u8, z: (idx >> 5) as u8 })
    }
    pub fn x(self) -> u8 {
        self.x
    }
    pub fn z(self) -> u8 {
        self.z
    }
    /// Position in the header tables, `x + z * 32`.
    pub fn index(self) -> usize {
        self.x as usize | (self.z as usize) << 5
    }
    pub fn all() -> impl Iterator<Item = Self> {
        (0..Self::COUNT).filter_map(Self::from_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_chunks_land_in_the_right_region() {
        let pos = ChunkPos::new(-1, -33);
        assert_eq!(pos.region(), RegionPos::new(-1, -2));
        assert_eq!(pos.local(), LocalPos::new(31, 31).unwrap());
        assert_eq!(pos.region().chunk(pos.local()), pos);
    }

    #[test]
    fn local_bounds() {
        assert!(LocalPos::new(32, 0).is_none());
        assert!(LocalPos::new(0, -1).is_none());
        assert_eq!(LocalPos::new(3, 4).unwrap().index(), 3 + 4 * 32);
        assert_eq!(LocalPos::all().count(), LocalPos::COUNT);
    }
}
