use strata_core::{ChunkPos, Dimension};

/// Record kind discriminant carried in the last byte of a chunk key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordTag {
    /// Chunk format version marker.
    Version,
    /// One 16-block-tall slice of terrain.
    SubChunk,
    /// Block entities (containers, signs, lodestones, ...).
    BlockEntities,
    /// Entities stored with the chunk.
    Entities,
    /// Biome/height data column.
    Data2d,
    /// Generation finalization state.
    Finalized,
    /// Recognized chunk record not needed by the conversion.
    Other(u8),
}

impl RecordTag {
    pub fn from_byte(b: u8) -> RecordTag {
        match b {
            0x2c => RecordTag::Version,
            0x2f => RecordTag::SubChunk,
            0x31 => RecordTag::BlockEntities,
            0x32 => RecordTag::Entities,
            0x2b => RecordTag::Data2d,
            0x36 => RecordTag::Finalized,
            other => RecordTag::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            RecordTag::Version => 0x2c,
            RecordTag::SubChunk => 0x2f,
            RecordTag::BlockEntities => 0x31,
            RecordTag::Entities => 0x32,
            RecordTag::Data2d => 0x2b,
            RecordTag::Finalized => 0x36,
            RecordTag::Other(b) => b,
        }
    }
}

/// Parsed chunk-keyed record address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub pos: ChunkPos,
    pub dimension: Dimension,
    pub tag: RecordTag,
    /// Vertical slice index, present only for [`RecordTag::SubChunk`].
    pub subchunk: Option<u8>,
}

impl ChunkKey {
    pub fn new(dimension: Dimension, pos: ChunkPos, tag: RecordTag) -> Self {
        Self {
            pos,
            dimension,
            tag,
            subchunk: None,
        }
    }

    /// Encode back into the store's key layout. The dimension id is
    /// omitted for the overworld, matching the source encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&self.pos.x.to_le_bytes());
        out.extend_from_slice(&self.pos.z.to_le_bytes());
        if self.dimension != Dimension::Overworld {
            out.extend_from_slice(&self.dimension.id().to_le_bytes());
        }
        out.push(self.tag.to_byte());
        if let Some(idx) = self.subchunk {
            out.push(idx);
        }
        out
    }

    /// Parse a chunk key. Layouts, by length:
    /// 9/10 bytes = overworld `[x][z][tag](subchunk)`,
    /// 13/14 bytes = `[x][z][dim][tag](subchunk)`.
    pub fn parse(key: &[u8]) -> Option<ChunkKey> {
        let (dim, tag_at) = match key.len() {
            9 | 10 => (Dimension::Overworld, 8),
            13 | 14 => {
                let id = i32::from_le_bytes(key[8..12].try_into().ok()?);
                (Dimension::from_id(id)?, 12)
            }
            _ => return None,
        };
        let x = i32::from_le_bytes(key[0..4].try_into().ok()?);
        let z = i32::from_le_bytes(key[4..8].try_into().ok()?);
        let tag = RecordTag::from_byte(key[tag_at]);
        let subchunk = key.get(tag_at + 1).copied();
        if subchunk.is_some() && tag != RecordTag::SubChunk {
            return None;
        }
        if subchunk.is_none() && tag == RecordTag::SubChunk {
            return None;
        }
        Some(ChunkKey {
            pos: ChunkPos::new(x, z),
            dimension: dim,
            tag,
            subchunk,
        })
    }
}

/// Classified source key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKey {
    Chunk(ChunkKey),
    /// Map asset record, `map_<id>`.
    Map(i64),
    /// The save's top-level metadata record.
    LocalPlayer,
    /// Well-known global record (portals, scoreboard, ...).
    Global(String),
    /// Anything the conversion does not consume.
    Other,
}

impl SourceKey {
    pub fn classify(key: &[u8]) -> SourceKey {
        if let Ok(text) = std::str::from_utf8(key) {
            if let Some(id) = text.strip_prefix("map_") {
                if let Ok(id) = id.parse::<i64>() {
                    return SourceKey::Map(id);
                }
            }
            match text {
                "~local_player" => return SourceKey::LocalPlayer,
                "portals" | "scoreboard" | "mobevents" | "BiomeData" => {
                    return SourceKey::Global(text.to_string());
                }
                _ => {}
            }
        }
        match ChunkKey::parse(key) {
            Some(ck) => SourceKey::Chunk(ck),
            None => SourceKey::Other,
        }
    }
}
