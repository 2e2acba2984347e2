use std::path::PathBuf;

use hashbrown::{HashMap, HashSet};
use log::debug;
use strata_core::{ChunkPos, Dimension, RegionPos, Result, StatusExt};
use strata_ctx::Record;

use crate::RegionFile;

/// Lazily-opened view over one dimension's written region files.
///
/// Terraform work reads a chunk's immediate neighbors, which may live
/// in adjacent region files; the scheduler guarantees nobody else holds
/// those files while this window does. Dirty files are written back on
/// [`RegionWindow::evict_outside`] and [`RegionWindow::flush`].
pub struct RegionWindow {
    dir: PathBuf,
    open: HashMap<RegionPos, RegionFile>,
    dirty: HashSet<RegionPos>,
}

impl RegionWindow {
    pub fn new(out_root: &std::path::Path, dim: Dimension) -> Self {
        Self {
            dir: out_root.join(dim.dir_name()),
            open: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    fn open_region(&mut self, region: RegionPos) -> Result<&mut RegionFile> {
        match self.open.entry(region) {
            hashbrown::hash_map::Entry::Occupied(slot) => Ok(slot.into_mut()),
            hashbrown::hash_map::Entry::Vacant(slot) => {
                let path = self.dir.join(region.file_name());
                let file = if path.exists() {
                    RegionFile::load(&path)?
                } else {
                    RegionFile::new()
                };
                Ok(slot.insert(file))
            }
        }
    }

    /// Read a chunk, opening its owning region file on demand.
    pub fn chunk(&mut self, pos: ChunkPos) -> Result<Option<Record>> {
        let (lx, lz) = pos.local();
        self.open_region(pos.region())?.extract(lx, lz)
    }

    pub fn contains(&mut self, pos: ChunkPos) -> Result<bool> {
        let (lx, lz) = pos.local();
        Ok(self.open_region(pos.region())?.contains(lx, lz))
    }

    /// Replace a chunk record and mark its region dirty.
    pub fn update(&mut self, pos: ChunkPos, record: &Record) -> Result<bool> {
        let region = pos.region();
        let (lx, lz) = pos.local();
        let inserted = self.open_region(region)?.insert(lx, lz, record)?;
        if inserted {
            self.dirty.insert(region);
        }
        Ok(inserted)
    }

    fn write_back(&mut self, region: RegionPos) -> Result<()> {
        if let Some(file) = self.open.get(&region) {
            if self.dirty.remove(&region) {
                let path = self.dir.join(region.file_name());
                file.save(&path)
                    .push_ctx(|| format!("flushing {}", path.display()))?;
                debug!("flushed {}", path.display());
            }
        }
        Ok(())
    }

    /// Drop cached regions outside the Chebyshev `radius` around
    /// `center`, writing back any that are dirty.
    pub fn evict_outside(&mut self, center: RegionPos, radius: i32) -> Result<()> {
        let far: Vec<RegionPos> = self
            .open
            .keys()
            .filter(|r| r.chebyshev(center) > radius)
            .copied()
            .collect();
        for region in far {
            self.write_back(region)?;
            self.open.remove(&region);
        }
        Ok(())
    }

    /// Write back everything and drop the cache.
    pub fn flush(&mut self) -> Result<()> {
        let all: Vec<RegionPos> = self.open.keys().copied().collect();
        for region in all {
            self.write_back(region)?;
        }
        self.open.clear();
        Ok(())
    }
}
