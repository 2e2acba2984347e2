use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use strata_core::{Result, Status, StatusExt};
use strata_ctx::Record;

/// Bytes per sector; files are always a whole number of sectors.
pub const SECTOR_SIZE: usize = 4096;
/// Chunks per region edge.
pub const REGION_WIDTH: usize = 32;

const SLOTS: usize = REGION_WIDTH * REGION_WIDTH;
/// Location entries store the sector count in one byte.
const MAX_CHUNK_SECTORS: usize = 255;
const COMPRESSION_ZLIB: u8 = 2;

/// One fixed-layout region file: a 1024-entry location table, a
/// matching timestamp table, then zlib-compressed compound payloads in
/// 4 KiB sectors.
///
/// The in-memory form holds compressed payloads per slot; `save` lays
/// sectors out sequentially. Exactly one worker owns a `RegionFile` at
/// a time, so there is no interior locking.
#[derive(Debug)]
pub struct RegionFile {
    payloads: Vec<Option<Vec<u8>>>,
    timestamps: Vec<u32>,
}

impl Default for RegionFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionFile {
    pub fn new() -> Self {
        Self {
            payloads: vec![None; SLOTS],
            timestamps: vec![0; SLOTS],
        }
    }

    #[inline]
    fn slot(local_x: i32, local_z: i32) -> Option<usize> {
        if (0..REGION_WIDTH as i32).contains(&local_x)
            && (0..REGION_WIDTH as i32).contains(&local_z)
        {
            Some((local_z as usize) * REGION_WIDTH + local_x as usize)
        } else {
            None
        }
    }

    /// Parse an existing file. A missing chunk slot stays empty;
    /// corrupt location entries are a hard error.
    pub fn load(path: &Path) -> Result<RegionFile> {
        let data =
            std::fs::read(path).push_ctx(|| format!("loading region {}", path.display()))?;
        Self::from_bytes(&data).push_ctx(|| format!("loading region {}", path.display()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<RegionFile> {
        if data.len() < SECTOR_SIZE * 2 {
            return Err(Status::malformed(format!(
                "header truncated ({} bytes)",
                data.len()
            )));
        }
        let mut region = RegionFile::new();
        for slot in 0..SLOTS {
            let at = slot * 4;
            let entry = u32::from_be_bytes(data[at..at + 4].try_into().unwrap());
            let offset = (entry >> 8) as usize;
            let sectors = (entry & 0xff) as usize;
            if sectors == 0 {
                continue;
            }
            let start = offset * SECTOR_SIZE;
            let end = start + sectors * SECTOR_SIZE;
            if start < SECTOR_SIZE * 2 || end > data.len() {
                return Err(Status::malformed(format!(
                    "slot {slot} points outside the file"
                )));
            }
            let len = u32::from_be_bytes(data[start..start + 4].try_into().unwrap()) as usize;
            if len < 1 || start + 4 + len > end {
                return Err(Status::malformed(format!("slot {slot} has a bad length")));
            }
            let scheme = data[start + 4];
            if scheme != COMPRESSION_ZLIB {
                return Err(Status::malformed(format!(
                    "slot {slot} uses unsupported compression {scheme}"
                )));
            }
            let ts_at = SECTOR_SIZE + slot * 4;
            region.timestamps[slot] =
                u32::from_be_bytes(data[ts_at..ts_at + 4].try_into().unwrap());
            region.payloads[slot] = Some(data[start + 5..start + 4 + len].to_vec());
        }
        Ok(region)
    }

    /// Decode the compound stored at a local chunk slot.
    pub fn extract(&self, local_x: i32, local_z: i32) -> Result<Option<Record>> {
        let Some(slot) = Self::slot(local_x, local_z) else {
            return Ok(None);
        };
        let Some(payload) = &self.payloads[slot] else {
            return Ok(None);
        };
        let mut raw = Vec::new();
        ZlibDecoder::new(payload.as_slice())
            .read_to_end(&mut raw)
            .map_err(|e| Status::malformed(e.to_string()))
            .push_ctx(|| format!("inflating chunk ({local_x}, {local_z})"))?;
        let rec: Record = fastnbt::from_bytes(&raw)
            .map_err(|e| Status::malformed(e.to_string()))
            .push_ctx(|| format!("decoding chunk ({local_x}, {local_z})"))?;
        Ok(Some(rec))
    }

    /// Encode a compound into a local chunk slot. Returns `false` when
    /// the slot is out of range or the payload exceeds the per-slot
    /// sector budget.
    pub fn insert(&mut self, local_x: i32, local_z: i32, record: &Record) -> Result<bool> {
        let Some(slot) = Self::slot(local_x, local_z) else {
            return Ok(false);
        };
        let raw = fastnbt::to_bytes(record)
            .map_err(|e| Status::malformed(e.to_string()))
            .push_ctx(|| format!("encoding chunk ({local_x}, {local_z})"))?;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&raw)
            .push_ctx(|| format!("compressing chunk ({local_x}, {local_z})"))?;
        let payload = enc
            .finish()
            .push_ctx(|| format!("compressing chunk ({local_x}, {local_z})"))?;
        let sectors = (payload.len() + 5).div_ceil(SECTOR_SIZE);
        if sectors > MAX_CHUNK_SECTORS {
            return Ok(false);
        }
        self.payloads[slot] = Some(payload);
        self.timestamps[slot] = now();
        Ok(true)
    }

    pub fn remove(&mut self, local_x: i32, local_z: i32) -> Option<Vec<u8>> {
        let slot = Self::slot(local_x, local_z)?;
        self.timestamps[slot] = 0;
        self.payloads[slot].take()
    }

    pub fn contains(&self, local_x: i32, local_z: i32) -> bool {
        Self::slot(local_x, local_z).is_some_and(|s| self.payloads[s].is_some())
    }

    pub fn chunk_count(&self) -> usize {
        self.payloads.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut locations = vec![0u8; SECTOR_SIZE];
        let mut timestamps = vec![0u8; SECTOR_SIZE];
        let mut body: Vec<u8> = Vec::new();
        let mut next_sector = 2usize;
        for slot in 0..SLOTS {
            let Some(payload) = &self.payloads[slot] else {
                continue;
            };
            let sectors = (payload.len() + 5).div_ceil(SECTOR_SIZE);
            let entry = ((next_sector as u32) << 8) | sectors as u32;
            locations[slot * 4..slot * 4 + 4].copy_from_slice(&entry.to_be_bytes());
            timestamps[slot * 4..slot * 4 + 4]
                .copy_from_slice(&self.timestamps[slot].to_be_bytes());
            body.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
            body.push(COMPRESSION_ZLIB);
            body.extend_from_slice(payload);
            let padded = sectors * SECTOR_SIZE;
            body.resize(body.len() + padded - (payload.len() + 5), 0);
            next_sector += sectors;
        }
        let mut out = locations;
        out.append(&mut timestamps);
        out.append(&mut body);
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())
            .push_ctx(|| format!("writing region {}", path.display()))
    }
}

fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
