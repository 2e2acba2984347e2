use std::collections::BTreeSet;

use hashbrown::HashMap;
use strata_core::{BlockPos, ChunkPos, Dimension, RegionPos};

use crate::{LodestoneRegistry, Manifest, MapAsset, StructureBounds};

/// Chunks known to exist, keyed by owning region. Built once during the
/// scan stage, read-only afterward.
#[derive(Clone, Debug, Default)]
pub struct ChunksInRegion {
    inner: HashMap<(Dimension, RegionPos), BTreeSet<ChunkPos>>,
}

impl ChunksInRegion {
    pub fn insert(&mut self, dim: Dimension, pos: ChunkPos) {
        self.inner.entry((dim, pos.region())).or_default().insert(pos);
    }

    pub fn chunks(&self, dim: Dimension, region: RegionPos) -> Option<&BTreeSet<ChunkPos>> {
        self.inner.get(&(dim, region))
    }

    pub fn regions(
        &self,
    ) -> impl Iterator<Item = (Dimension, RegionPos, &BTreeSet<ChunkPos>)> + '_ {
        self.inner.iter().map(|((d, r), set)| (*d, *r, set))
    }

    pub fn regions_in(&self, dim: Dimension) -> Vec<RegionPos> {
        let mut out: Vec<RegionPos> = self
            .inner
            .keys()
            .filter(|(d, _)| *d == dim)
            .map(|(_, r)| *r)
            .collect();
        out.sort();
        out
    }

    pub fn total_chunks(&self) -> usize {
        self.inner.values().map(BTreeSet::len).sum()
    }

    pub fn region_count(&self) -> usize {
        self.inner.len()
    }

    /// Dimensions with at least one known chunk, in fixed order.
    pub fn dimensions(&self) -> Vec<Dimension> {
        Dimension::ALL
            .into_iter()
            .filter(|d| self.inner.keys().any(|(dim, _)| dim == d))
            .collect()
    }

    /// Inclusive region bounding rectangle for a dimension.
    pub fn bounds(&self, dim: Dimension) -> Option<(RegionPos, RegionPos)> {
        let mut it = self.inner.keys().filter(|(d, _)| *d == dim).map(|(_, r)| *r);
        let first = it.next()?;
        let (mut min, mut max) = (first, first);
        for r in it {
            min.x = min.x.min(r.x);
            min.z = min.z.min(r.z);
            max.x = max.x.max(r.x);
            max.z = max.z.max(r.z);
        }
        Some((min, max))
    }

    fn merge_into(self, into: &mut ChunksInRegion) {
        for (key, set) in self.inner {
            into.inner.entry(key).or_default().extend(set);
        }
    }
}

/// One region's worth of conversion work. Produced by the scan stage,
/// consumed exactly once by the region-conversion stage.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub dimension: Dimension,
    pub region: RegionPos,
    pub chunks: Vec<ChunkPos>,
}

/// Per-partition scan accumulator: partial manifest fragments merged
/// associatively into the run total, then discarded.
#[derive(Clone, Debug, Default)]
pub struct Accum {
    pub chunks: ChunksInRegion,
    pub maps: HashMap<i64, MapAsset>,
    pub structures: HashMap<Dimension, Vec<StructureBounds>>,
    pub lodestone_candidates: BTreeSet<(Dimension, BlockPos)>,
    pub records_seen: u64,
    pub chunk_records: u64,
    pub skipped_malformed: u64,
}

impl Accum {
    pub fn add_structure(&mut self, dim: Dimension, bounds: StructureBounds) {
        self.structures.entry(dim).or_default().push(bounds);
    }

    /// Fold this accumulator into `into`. Associative and commutative
    /// up to ordering of the structure lists, which are sorted at
    /// manifest build.
    pub fn merge(self, into: &mut Accum) {
        self.chunks.merge_into(&mut into.chunks);
        for (k, v) in self.maps {
            into.maps.entry(k).or_insert(v);
        }
        for (dim, list) in self.structures {
            into.structures.entry(dim).or_default().extend(list);
        }
        into.lodestone_candidates.extend(self.lodestone_candidates);
        into.records_seen += self.records_seen;
        into.chunk_records += self.chunk_records;
        into.skipped_malformed += self.skipped_malformed;
    }

    /// Freeze into the immutable manifest plus the region work list,
    /// largest regions first for load balancing.
    pub fn into_manifest(self) -> (Manifest, Vec<WorkItem>) {
        let mut structures = self.structures;
        for list in structures.values_mut() {
            list.sort_by(|a, b| (a.owner, &a.kind).cmp(&(b.owner, &b.kind)));
        }
        let lodestones = LodestoneRegistry::from_candidates(self.lodestone_candidates);

        let mut items: Vec<WorkItem> = self
            .chunks
            .regions()
            .map(|(dimension, region, set)| WorkItem {
                dimension,
                region,
                chunks: set.iter().copied().collect(),
            })
            .collect();
        items.sort_by(|a, b| {
            b.chunks
                .len()
                .cmp(&a.chunks.len())
                .then_with(|| (a.dimension, a.region).cmp(&(b.dimension, b.region)))
        });

        let manifest = Manifest {
            maps: self.maps,
            structures,
            lodestones,
            chunks: self.chunks,
        };
        (manifest, items)
    }
}
