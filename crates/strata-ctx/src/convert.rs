use fastnbt::Value;
use strata_core::{BlockPos, ChunkPos, Dimension, Result};

use crate::record;
use crate::{Context, LeashAnchor, LeashTarget, Record, RootVehicle, VehicleLink};

/// Per-record conversion functions supplied by a source dialect.
///
/// Implementations are pure over the record: the core never inspects
/// their internals, only calls them and merges the contexts they
/// mutate.
pub trait Converter: Send + Sync {
    /// Chunk terrain record: source compound in, destination compound out.
    fn convert_chunk(
        &self,
        dimension: Dimension,
        pos: ChunkPos,
        record: Record,
        ctx: &mut Context,
    ) -> Result<Record>;

    fn convert_item(&self, record: Record, ctx: &mut Context) -> Record;

    fn convert_block_entity(
        &self,
        pos: BlockPos,
        block: &str,
        record: Record,
        ctx: &mut Context,
    ) -> Record;

    fn convert_entity(&self, record: Record, ctx: &mut Context) -> Result<Record>;
}

/// Harvest cross-chunk relationship state from a converted entity
/// record into the worker's context. Called by the region stage after
/// each `convert_entity`, so converters stay free of placement state.
pub fn harvest_relationships(
    dimension: Dimension,
    chunk: ChunkPos,
    rec: &Record,
    ctx: &mut Context,
) {
    let Some(uuid) = record::entity_uuid(rec) else {
        return;
    };
    if let Some(local) = record::get_i64(rec, "UniqueID") {
        ctx.uuids.insert(local, uuid);
    }

    if let Some(leash) = record::get(rec, "Leash") {
        let target = match record::entity_uuid(leash) {
            Some(holder) => Some(LeashTarget::Entity(holder)),
            None => record::block_pos(leash).map(LeashTarget::Post),
        };
        if let Some(target) = target {
            ctx.leashes.entry(uuid).or_insert(LeashAnchor {
                dimension,
                chunk,
                target,
            });
        }
    }

    if let Some(vehicle) = record::get(rec, "Vehicle").and_then(record::uuid_value) {
        ctx.vehicles.entry(uuid).or_insert(VehicleLink {
            dimension,
            chunk,
            vehicle,
        });
    }

    if ctx.root_vehicle.is_none() {
        if let Some(root) = record::get(rec, "RootVehicle") {
            if let (Some(vehicle), Some(entity)) = (
                record::get(root, "Attach").and_then(record::uuid_value),
                record::get(root, "Entity"),
            ) {
                ctx.root_vehicle = Some(RootVehicle {
                    dimension,
                    chunk,
                    vehicle,
                    record: entity.clone(),
                });
            }
        }
    }

    if ctx.shoulder_left.is_none() {
        if let Some(Value::Compound(c)) = record::get(rec, "ShoulderEntityLeft") {
            if !c.is_empty() {
                ctx.shoulder_left = record::get(rec, "ShoulderEntityLeft").cloned();
            }
        }
    }
    if ctx.shoulder_right.is_none() {
        if let Some(Value::Compound(c)) = record::get(rec, "ShoulderEntityRight") {
            if !c.is_empty() {
                ctx.shoulder_right = record::get(rec, "ShoulderEntityRight").cloned();
            }
        }
    }
}

/// Identity converter with registry bookkeeping only. Used by tests and
/// as the fallback when no dialect rename pack is selected.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughConverter;

impl PassthroughConverter {
    fn convert_item_list(&self, rec: &mut Record, key: &str, ctx: &mut Context) {
        let Some(Value::List(items)) = record::remove(rec, key) else {
            return;
        };
        let converted: Vec<Value> = items
            .into_iter()
            .map(|item| self.convert_item(item, ctx))
            .collect();
        record::set(rec, key, Value::List(converted));
    }
}

impl Converter for PassthroughConverter {
    fn convert_chunk(
        &self,
        _dimension: Dimension,
        _pos: ChunkPos,
        record: Record,
        _ctx: &mut Context,
    ) -> Result<Record> {
        Ok(record)
    }

    fn convert_item(&self, record: Record, ctx: &mut Context) -> Record {
        let mut rec = record;
        match record::get_str(&rec, "id") {
            Some("minecraft:bundle") => ctx.flags.bundles = true,
            Some("minecraft:lodestone_compass") => {
                ctx.flags.lodestone_compasses = true;
                let tracked = record::get(&rec, "tag")
                    .and_then(|tag| record::get(tag, "LodestonePos"))
                    .and_then(record::block_pos)
                    .zip(
                        record::get(&rec, "tag")
                            .and_then(|tag| record::get_i32(tag, "LodestoneDimension"))
                            .and_then(Dimension::from_id),
                    );
                if let Some((pos, dim)) = tracked {
                    if let Some(handle) = ctx.manifest().lodestones.handle_for(dim, pos) {
                        if let Some(tag) = record::get_mut(&mut rec, "tag") {
                            record::set(tag, "LodestoneTrackerId", Value::Int(handle));
                        }
                    }
                }
            }
            _ => {}
        }
        rec
    }

    fn convert_block_entity(
        &self,
        _pos: BlockPos,
        _block: &str,
        record: Record,
        ctx: &mut Context,
    ) -> Record {
        let mut rec = record;
        self.convert_item_list(&mut rec, "Items", ctx);
        rec
    }

    fn convert_entity(&self, record: Record, ctx: &mut Context) -> Result<Record> {
        let mut rec = record;
        self.convert_item_list(&mut rec, "Items", ctx);
        self.convert_item_list(&mut rec, "Inventory", ctx);
        Ok(rec)
    }
}
