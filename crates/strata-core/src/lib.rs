//! Coordinate types and the `Status` error chain shared by all strata crates.
#![forbid(unsafe_code)]

mod status;

pub use status::{ErrorKind, Result, Status, StatusExt};

/// Progress/cancellation callback shared by the pipeline stages.
///
/// Returning `false` requests cooperative cancellation: workers finish
/// their current unit of work and stop taking new ones.
pub trait Progress: Send + Sync {
    fn report(&self, done: u64, total: u64) -> bool;
}

/// Progress sink that never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn report(&self, _done: u64, _total: u64) -> bool {
        true
    }
}

/// Chunks per region edge; a region file holds `REGION_CHUNKS * REGION_CHUNKS` chunks.
pub const REGION_CHUNKS: i32 = 32;

/// One of the world's parallel spatial domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Overworld,
    Nether,
    End,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Overworld, Dimension::Nether, Dimension::End];

    /// Subdirectory name under the destination root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Dimension::Overworld => "region",
            Dimension::Nether => "DIM-1",
            Dimension::End => "DIM1",
        }
    }

    /// Numeric id used by the source store's chunk keys.
    #[inline]
    pub fn id(self) -> i32 {
        match self {
            Dimension::Overworld => 0,
            Dimension::Nether => 1,
            Dimension::End => 2,
        }
    }

    #[inline]
    pub fn from_id(id: i32) -> Option<Dimension> {
        match id {
            0 => Some(Dimension::Overworld),
            1 => Some(Dimension::Nether),
            2 => Some(Dimension::End),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dimension::Overworld => "overworld",
            Dimension::Nether => "nether",
            Dimension::End => "end",
        };
        f.write_str(name)
    }
}

/// Chunk coordinate within a dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Region containing this chunk.
    #[inline]
    pub fn region(self) -> RegionPos {
        RegionPos {
            x: self.x.div_euclid(REGION_CHUNKS),
            z: self.z.div_euclid(REGION_CHUNKS),
        }
    }

    /// Local coordinates within the owning region, each in `0..32`.
    #[inline]
    pub fn local(self) -> (i32, i32) {
        (
            self.x.rem_euclid(REGION_CHUNKS),
            self.z.rem_euclid(REGION_CHUNKS),
        )
    }
}

/// Region coordinate: a 32x32 block of chunks stored in one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// File name in the destination layout, e.g. `r.0.-1.mca`.
    pub fn file_name(self) -> String {
        format!("r.{}.{}.mca", self.x, self.z)
    }

    /// Parse a region file name back into its coordinate.
    pub fn from_file_name(name: &str) -> Option<RegionPos> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() == 4 && parts[0] == "r" && parts[3] == "mca" {
            let x = parts[1].parse().ok()?;
            let z = parts[2].parse().ok()?;
            Some(RegionPos { x, z })
        } else {
            None
        }
    }

    /// World chunk coordinate of a local chunk slot.
    #[inline]
    pub fn chunk_at(self, local_x: i32, local_z: i32) -> ChunkPos {
        ChunkPos {
            x: self.x * REGION_CHUNKS + local_x,
            z: self.z * REGION_CHUNKS + local_z,
        }
    }

    /// Chebyshev distance to another region.
    #[inline]
    pub fn chebyshev(self, other: RegionPos) -> i32 {
        (self.x - other.x).abs().max((self.z - other.z).abs())
    }
}

/// Absolute block position within a dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn chunk(self) -> ChunkPos {
        ChunkPos {
            x: self.x.div_euclid(16),
            z: self.z.div_euclid(16),
        }
    }
}
