//! Shared, mergeable conversion state: manifest, registries, work items.
#![forbid(unsafe_code)]

mod accum;
mod convert;
pub mod record;
#[cfg(test)]
mod tests;

pub use accum::{Accum, ChunksInRegion, WorkItem};
pub use convert::{Converter, PassthroughConverter, harvest_relationships};

use std::sync::Arc;

use hashbrown::HashMap;
use strata_core::{BlockPos, ChunkPos, Dimension};

/// Compound record as read from and written to the stores.
pub type Record = fastnbt::Value;

/// One map item asset: display metadata plus the pixel buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct MapAsset {
    pub scale: u8,
    pub dimension: Dimension,
    pub center_x: i32,
    pub center_z: i32,
    pub pixels: Vec<u8>,
}

/// Typed structure bounding volume, tagged with its owning chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructureBounds {
    pub kind: String,
    pub min: BlockPos,
    pub max: BlockPos,
    pub owner: ChunkPos,
}

/// Integer tracking handles for lodestone blocks, assigned once at
/// manifest build so conversion workers read an immutable lookup.
#[derive(Clone, Debug, Default)]
pub struct LodestoneRegistry {
    by_handle: HashMap<i32, (Dimension, BlockPos)>,
    by_pos: HashMap<(Dimension, BlockPos), i32>,
}

impl LodestoneRegistry {
    pub fn from_candidates(candidates: impl IntoIterator<Item = (Dimension, BlockPos)>) -> Self {
        let mut reg = Self::default();
        let mut next = 1i32;
        for (dim, pos) in candidates {
            if reg.by_pos.contains_key(&(dim, pos)) {
                continue;
            }
            reg.by_handle.insert(next, (dim, pos));
            reg.by_pos.insert((dim, pos), next);
            next += 1;
        }
        reg
    }

    pub fn handle_for(&self, dim: Dimension, pos: BlockPos) -> Option<i32> {
        self.by_pos.get(&(dim, pos)).copied()
    }

    pub fn resolve(&self, handle: i32) -> Option<(Dimension, BlockPos)> {
        self.by_handle.get(&handle).copied()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

/// Bidirectional local storage id <-> canonical entity id mapping.
#[derive(Clone, Debug, Default)]
pub struct UuidRegistry {
    by_local: HashMap<i64, u128>,
    by_canonical: HashMap<u128, i64>,
}

impl UuidRegistry {
    /// Record a pairing. The first observation of either side wins;
    /// a true duplicate (identical pair) is a no-op.
    pub fn insert(&mut self, local: i64, canonical: u128) {
        if self.by_local.contains_key(&local) || self.by_canonical.contains_key(&canonical) {
            return;
        }
        self.by_local.insert(local, canonical);
        self.by_canonical.insert(canonical, local);
    }

    pub fn canonical_for(&self, local: i64) -> Option<u128> {
        self.by_local.get(&local).copied()
    }

    pub fn local_for(&self, canonical: u128) -> Option<i64> {
        self.by_canonical.get(&canonical).copied()
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    fn merge_into(self, into: &mut UuidRegistry) {
        for (local, canonical) in self.by_local {
            into.insert(local, canonical);
        }
    }
}

/// What a leash anchors to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeashTarget {
    /// Tied to a fence post block.
    Post(BlockPos),
    /// Held by another entity, by canonical id.
    Entity(u128),
}

/// A leashed entity observed during conversion, keyed by holder id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeashAnchor {
    pub dimension: Dimension,
    pub chunk: ChunkPos,
    pub target: LeashTarget,
}

/// Passenger-to-vehicle attachment crossing a chunk boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VehicleLink {
    pub dimension: Dimension,
    pub chunk: ChunkPos,
    pub vehicle: u128,
}

/// The vehicle the local player was riding; relocated under the player
/// record by the stitching pass. Set once, never overwritten.
#[derive(Clone, Debug)]
pub struct RootVehicle {
    pub dimension: Dimension,
    pub chunk: ChunkPos,
    pub vehicle: u128,
    pub record: Record,
}

/// Content observations toggled during conversion and written into the
/// destination's enabled-features metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    pub bundles: bool,
    pub lodestone_compasses: bool,
    pub unknown_blocks: bool,
}

impl FeatureFlags {
    fn merge(&mut self, other: FeatureFlags) {
        self.bundles |= other.bundles;
        self.lodestone_compasses |= other.lodestone_compasses;
        self.unknown_blocks |= other.unknown_blocks;
    }
}

/// Immutable global manifest produced by the scan stage.
#[derive(Debug, Default)]
pub struct Manifest {
    pub maps: HashMap<i64, MapAsset>,
    pub structures: HashMap<Dimension, Vec<StructureBounds>>,
    pub lodestones: LodestoneRegistry,
    pub chunks: ChunksInRegion,
}

/// Mergeable per-run conversion state.
///
/// The root context is created once at pipeline start; workers operate
/// on children from [`Context::make`] and fold them back with
/// [`Context::merge_into`]. Merging is associative and never drops an
/// entry present in only one operand.
#[derive(Clone, Debug)]
pub struct Context {
    manifest: Arc<Manifest>,
    pub uuids: UuidRegistry,
    pub leashes: HashMap<u128, LeashAnchor>,
    pub vehicles: HashMap<u128, VehicleLink>,
    pub root_vehicle: Option<RootVehicle>,
    pub shoulder_left: Option<Record>,
    pub shoulder_right: Option<Record>,
    pub flags: FeatureFlags,
}

impl Context {
    pub fn new(manifest: Manifest) -> Self {
        Self::with_manifest(Arc::new(manifest))
    }

    fn with_manifest(manifest: Arc<Manifest>) -> Self {
        Self {
            manifest,
            uuids: UuidRegistry::default(),
            leashes: HashMap::new(),
            vehicles: HashMap::new(),
            root_vehicle: None,
            shoulder_left: None,
            shoulder_right: None,
            flags: FeatureFlags::default(),
        }
    }

    /// Child context for one worker: shares the read-only manifest,
    /// starts with empty relationship tables.
    pub fn make(&self) -> Context {
        Self::with_manifest(Arc::clone(&self.manifest))
    }

    #[inline]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Fold this context into `into`.
    ///
    /// Registries union; identical keys keep the receiver's entry.
    /// Singleton slots (root vehicle, shoulder payloads) are first-wins:
    /// the receiver's value survives if already set. Flags are OR'd.
    pub fn merge_into(self, into: &mut Context) {
        self.uuids.merge_into(&mut into.uuids);
        for (k, v) in self.leashes {
            into.leashes.entry(k).or_insert(v);
        }
        for (k, v) in self.vehicles {
            into.vehicles.entry(k).or_insert(v);
        }
        if into.root_vehicle.is_none() {
            into.root_vehicle = self.root_vehicle;
        }
        if into.shoulder_left.is_none() {
            into.shoulder_left = self.shoulder_left;
        }
        if into.shoulder_right.is_none() {
            into.shoulder_right = self.shoulder_right;
        }
        into.flags.merge(self.flags);
    }
}
