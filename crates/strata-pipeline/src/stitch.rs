//! Cross-region relationship grafting over written region files.
//!
//! Conversion workers record leash and vehicle anchors they cannot
//! resolve locally; after every region is on disk this pass loads the
//! owning chunks, finds the entities by canonical id and grafts the
//! relationship records in place.

use std::path::Path;

use fastnbt::Value;
use hashbrown::HashMap;
use log::{debug, warn};
use strata_core::{ChunkPos, Dimension, Result};
use strata_ctx::{Context, LeashTarget, Record, record};
use strata_region::RegionWindow;

#[derive(Clone, Copy, Debug, Default)]
pub struct StitchStats {
    pub leashes: u64,
    pub vehicles: u64,
    /// Anchors whose target entity was not found in any written chunk.
    pub unresolved: u64,
}

fn entities_mut(chunk: &mut Record) -> Option<&mut Vec<Value>> {
    match record::get_mut(chunk, "entities") {
        Some(Value::List(list)) => Some(list),
        _ => None,
    }
}

fn find_entity(list: &[Value], id: u128) -> Option<usize> {
    list.iter().position(|e| record::entity_uuid(e) == Some(id))
}

struct Windows<'a> {
    out_root: &'a Path,
    open: HashMap<Dimension, RegionWindow>,
}

impl<'a> Windows<'a> {
    fn new(out_root: &'a Path) -> Self {
        Self {
            out_root,
            open: HashMap::new(),
        }
    }

    fn get(&mut self, dim: Dimension) -> &mut RegionWindow {
        self.open
            .entry(dim)
            .or_insert_with(|| RegionWindow::new(self.out_root, dim))
    }

    fn flush(&mut self) -> Result<()> {
        for window in self.open.values_mut() {
            window.flush()?;
        }
        Ok(())
    }
}

fn leash_record(target: &LeashTarget) -> Value {
    match target {
        LeashTarget::Post(pos) => record::compound(vec![
            ("X", Value::Int(pos.x)),
            ("Y", Value::Int(pos.y)),
            ("Z", Value::Int(pos.z)),
        ]),
        LeashTarget::Entity(holder) => record::compound(vec![(
            "UUID",
            Value::IntArray(fastnbt::IntArray::new(
                record::uuid_to_int_array(*holder).to_vec(),
            )),
        )]),
    }
}

fn graft_leashes(ctx: &Context, windows: &mut Windows<'_>, stats: &mut StitchStats) -> Result<()> {
    for (&id, anchor) in &ctx.leashes {
        let window = windows.get(anchor.dimension);
        let Some(mut chunk) = window.chunk(anchor.chunk)? else {
            stats.unresolved += 1;
            continue;
        };
        let Some(idx) = entities_mut(&mut chunk).and_then(|list| find_entity(list, id)) else {
            warn!(
                "leashed entity {id:#034x} missing from {} chunk ({}, {})",
                anchor.dimension, anchor.chunk.x, anchor.chunk.z
            );
            stats.unresolved += 1;
            continue;
        };
        if let Some(list) = entities_mut(&mut chunk) {
            record::set(&mut list[idx], "leash", leash_record(&anchor.target));
        }
        window.update(anchor.chunk, &chunk)?;
        stats.leashes += 1;
    }
    Ok(())
}

/// Chunks that can hold the vehicle of a passenger parked in `center`:
/// the chunk itself, then its eight neighbors. Neighbors may live in an
/// adjacent region file; the window opens those on demand.
fn vehicle_search_order(center: ChunkPos) -> impl Iterator<Item = ChunkPos> {
    (-1..=1).flat_map(move |dz| {
        (-1..=1).map(move |dx| ChunkPos {
            x: center.x + dx,
            z: center.z + dz,
        })
    })
}

fn push_passenger(vehicle: &mut Value, passenger: Value) {
    match record::get_mut(vehicle, "Passengers") {
        Some(Value::List(list)) => list.push(passenger),
        _ => record::set(vehicle, "Passengers", Value::List(vec![passenger])),
    }
}

fn graft_vehicles(ctx: &Context, windows: &mut Windows<'_>, stats: &mut StitchStats) -> Result<()> {
    for (&passenger_id, link) in &ctx.vehicles {
        let window = windows.get(link.dimension);
        let Some(mut home) = window.chunk(link.chunk)? else {
            stats.unresolved += 1;
            continue;
        };

        // The vehicle usually sits in the same chunk; a ride crossing a
        // chunk (or region) boundary lands it in a neighbor.
        let same_chunk = entities_mut(&mut home)
            .and_then(|list| find_entity(list, link.vehicle))
            .is_some();
        if same_chunk {
            let Some(list) = entities_mut(&mut home) else {
                stats.unresolved += 1;
                continue;
            };
            let Some(pi) = find_entity(list, passenger_id) else {
                stats.unresolved += 1;
                continue;
            };
            let passenger = list.remove(pi);
            if let Some(vi) = find_entity(list, link.vehicle) {
                push_passenger(&mut list[vi], passenger);
                window.update(link.chunk, &home)?;
                stats.vehicles += 1;
            } else {
                stats.unresolved += 1;
            }
            continue;
        }

        let mut grafted = false;
        for pos in vehicle_search_order(link.chunk) {
            if pos == link.chunk {
                continue;
            }
            let Some(mut away) = window.chunk(pos)? else {
                continue;
            };
            let Some(vi) = entities_mut(&mut away).and_then(|list| find_entity(list, link.vehicle))
            else {
                continue;
            };
            let Some(passenger) = entities_mut(&mut home)
                .and_then(|list| find_entity(list, passenger_id).map(|pi| list.remove(pi)))
            else {
                break;
            };
            if let Some(list) = entities_mut(&mut away) {
                push_passenger(&mut list[vi], passenger);
            }
            window.update(link.chunk, &home)?;
            window.update(pos, &away)?;
            stats.vehicles += 1;
            grafted = true;
            break;
        }
        if !grafted {
            warn!(
                "vehicle {:#034x} for passenger {passenger_id:#034x} not found near \
                 {} chunk ({}, {})",
                link.vehicle, link.dimension, link.chunk.x, link.chunk.z
            );
            stats.unresolved += 1;
        }
    }
    Ok(())
}

/// Pull the root vehicle's live record out of its written chunk so the
/// caller can nest it under the player. Prefers the on-disk record over
/// the one captured during conversion, which may predate later passes.
pub fn extract_root_vehicle(ctx: &Context, out_root: &Path) -> Result<Option<Record>> {
    let Some(rv) = &ctx.root_vehicle else {
        return Ok(None);
    };
    let mut window = RegionWindow::new(out_root, rv.dimension);
    let extracted = match window.chunk(rv.chunk)? {
        Some(mut chunk) => {
            let pulled = entities_mut(&mut chunk)
                .and_then(|list| find_entity(list, rv.vehicle).map(|i| list.remove(i)));
            if pulled.is_some() {
                window.update(rv.chunk, &chunk)?;
                window.flush()?;
            }
            pulled
        }
        None => None,
    };
    debug!(
        "root vehicle {:#034x}: {}",
        rv.vehicle,
        if extracted.is_some() {
            "relocated from chunk"
        } else {
            "using captured record"
        }
    );
    Ok(Some(extracted.unwrap_or_else(|| rv.record.clone())))
}

/// Graft every recorded leash and vehicle relationship into the written
/// region files.
pub fn stitch_relationships(ctx: &Context, out_root: &Path) -> Result<StitchStats> {
    let mut stats = StitchStats::default();
    let mut windows = Windows::new(out_root);
    graft_leashes(ctx, &mut windows, &mut stats)?;
    graft_vehicles(ctx, &mut windows, &mut stats)?;
    windows.flush()?;
    debug!(
        "stitched {} leash(es), {} vehicle link(s), {} unresolved",
        stats.leashes, stats.vehicles, stats.unresolved
    );
    Ok(stats)
}
