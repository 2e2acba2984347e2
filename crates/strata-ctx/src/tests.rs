use super::*;
use fastnbt::Value;
use proptest::prelude::*;
use strata_core::{BlockPos, ChunkPos, Dimension, RegionPos};

use crate::convert::harvest_relationships;
use crate::record;

fn leash_anchor(x: i32) -> LeashAnchor {
    LeashAnchor {
        dimension: Dimension::Overworld,
        chunk: ChunkPos::new(x, 0),
        target: LeashTarget::Post(BlockPos::new(x, 64, 0)),
    }
}

#[test]
fn merge_unions_disjoint_registries() {
    let root = Context::new(Manifest::default());
    let mut a = root.make();
    let mut b = root.make();
    a.uuids.insert(1, 100);
    a.leashes.insert(10, leash_anchor(1));
    b.uuids.insert(2, 200);
    b.leashes.insert(20, leash_anchor(2));
    b.flags.bundles = true;

    let mut total = root.make();
    a.merge_into(&mut total);
    b.merge_into(&mut total);

    assert_eq!(total.uuids.len(), 2);
    assert_eq!(total.uuids.canonical_for(1), Some(100));
    assert_eq!(total.uuids.canonical_for(2), Some(200));
    assert_eq!(total.leashes.len(), 2);
    assert!(total.flags.bundles);
    assert!(!total.flags.lodestone_compasses);
}

#[test]
fn merge_keeps_receiver_on_identical_keys() {
    let root = Context::new(Manifest::default());
    let mut total = root.make();
    total.leashes.insert(10, leash_anchor(1));
    let mut child = root.make();
    child.leashes.insert(10, leash_anchor(99));
    child.merge_into(&mut total);
    assert_eq!(total.leashes[&10], leash_anchor(1));
}

#[test]
fn singleton_slots_are_first_wins() {
    let root = Context::new(Manifest::default());
    let mut total = root.make();

    let mut first = root.make();
    first.root_vehicle = Some(RootVehicle {
        dimension: Dimension::Overworld,
        chunk: ChunkPos::new(0, 0),
        vehicle: 7,
        record: Value::Int(1),
    });
    first.shoulder_left = Some(Value::Int(1));
    first.merge_into(&mut total);

    let mut second = root.make();
    second.root_vehicle = Some(RootVehicle {
        dimension: Dimension::Nether,
        chunk: ChunkPos::new(9, 9),
        vehicle: 8,
        record: Value::Int(2),
    });
    second.shoulder_left = Some(Value::Int(2));
    second.shoulder_right = Some(Value::Int(3));
    second.merge_into(&mut total);

    assert_eq!(total.root_vehicle.as_ref().unwrap().vehicle, 7);
    assert_eq!(total.shoulder_left, Some(Value::Int(1)));
    assert_eq!(total.shoulder_right, Some(Value::Int(3)));
}

#[test]
fn make_shares_manifest() {
    let mut accum = Accum::default();
    accum
        .lodestone_candidates
        .insert((Dimension::End, BlockPos::new(1, 2, 3)));
    let (manifest, _) = accum.into_manifest();
    let root = Context::new(manifest);
    let child = root.make();
    assert_eq!(
        child
            .manifest()
            .lodestones
            .handle_for(Dimension::End, BlockPos::new(1, 2, 3)),
        Some(1)
    );
    assert!(child.leashes.is_empty());
    assert!(child.uuids.is_empty());
}

#[test]
fn lodestone_handles_are_dense_and_deduped() {
    let reg = LodestoneRegistry::from_candidates(vec![
        (Dimension::Overworld, BlockPos::new(0, 60, 0)),
        (Dimension::Overworld, BlockPos::new(0, 60, 0)),
        (Dimension::Nether, BlockPos::new(5, 60, 5)),
    ]);
    assert_eq!(reg.len(), 2);
    assert_eq!(
        reg.resolve(1),
        Some((Dimension::Overworld, BlockPos::new(0, 60, 0)))
    );
    assert_eq!(reg.resolve(2), Some((Dimension::Nether, BlockPos::new(5, 60, 5))));
    assert_eq!(reg.resolve(3), None);
}

#[test]
fn uuid_registry_is_bidirectional_and_first_wins() {
    let mut reg = UuidRegistry::default();
    reg.insert(-4, 400);
    reg.insert(-4, 999);
    reg.insert(-5, 400);
    assert_eq!(reg.canonical_for(-4), Some(400));
    assert_eq!(reg.local_for(400), Some(-4));
    assert_eq!(reg.len(), 1);
}

#[test]
fn work_items_sorted_by_descending_chunk_count() {
    let mut accum = Accum::default();
    for z in 0..3 {
        accum.chunks.insert(Dimension::Overworld, ChunkPos::new(40, z));
    }
    accum.chunks.insert(Dimension::Overworld, ChunkPos::new(0, 0));
    for z in 0..2 {
        accum.chunks.insert(Dimension::Nether, ChunkPos::new(-1, z));
    }
    let (_, items) = accum.into_manifest();
    let counts: Vec<usize> = items.iter().map(|w| w.chunks.len()).collect();
    assert_eq!(counts, vec![3, 2, 1]);
    assert_eq!(items[0].region, RegionPos::new(1, 0));
}

#[test]
fn chunks_in_region_bounds() {
    let mut chunks = ChunksInRegion::default();
    chunks.insert(Dimension::Overworld, ChunkPos::new(-33, 0));
    chunks.insert(Dimension::Overworld, ChunkPos::new(70, 40));
    assert_eq!(
        chunks.bounds(Dimension::Overworld),
        Some((RegionPos::new(-2, 0), RegionPos::new(2, 1)))
    );
    assert_eq!(chunks.bounds(Dimension::End), None);
}

#[test]
fn harvest_reads_leash_and_vehicle() {
    let root = Context::new(Manifest::default());
    let mut ctx = root.make();
    let mut rec = record::compound(vec![("UniqueID", Value::Long(-12))]);
    record::set_entity_uuid(&mut rec, 900);
    record::set(
        &mut rec,
        "Leash",
        record::compound(vec![
            ("x", Value::Int(4)),
            ("y", Value::Int(65)),
            ("z", Value::Int(-2)),
        ]),
    );
    record::set(
        &mut rec,
        "Vehicle",
        Value::IntArray(fastnbt::IntArray::new(
            record::uuid_to_int_array(901).to_vec(),
        )),
    );

    harvest_relationships(Dimension::Overworld, ChunkPos::new(0, 0), &rec, &mut ctx);

    assert_eq!(ctx.uuids.canonical_for(-12), Some(900));
    assert_eq!(
        ctx.leashes[&900].target,
        LeashTarget::Post(BlockPos::new(4, 65, -2))
    );
    assert_eq!(ctx.vehicles[&900].vehicle, 901);
}

#[test]
fn passthrough_assigns_lodestone_tracker_handle() {
    let mut accum = Accum::default();
    accum
        .lodestone_candidates
        .insert((Dimension::Overworld, BlockPos::new(10, 64, -3)));
    let (manifest, _) = accum.into_manifest();
    let root = Context::new(manifest);
    let mut ctx = root.make();

    let item = record::compound(vec![
        ("id", Value::String("minecraft:lodestone_compass".into())),
        (
            "tag",
            record::compound(vec![
                (
                    "LodestonePos",
                    record::compound(vec![
                        ("x", Value::Int(10)),
                        ("y", Value::Int(64)),
                        ("z", Value::Int(-3)),
                    ]),
                ),
                ("LodestoneDimension", Value::Int(0)),
            ]),
        ),
    ]);
    let out = PassthroughConverter.convert_item(item, &mut ctx);
    assert!(ctx.flags.lodestone_compasses);
    let tag = record::get(&out, "tag").unwrap();
    assert_eq!(record::get_i32(tag, "LodestoneTrackerId"), Some(1));
}

proptest! {
    // Merge is associative: (a+b)+c == a+(b+c) fold into fresh totals.
    #[test]
    fn accum_merge_associative(
        counts in proptest::collection::vec(0u64..50, 3),
        xs in proptest::collection::vec(-64i32..64, 3),
    ) {
        let make = |i: usize| {
            let mut a = Accum::default();
            a.records_seen = counts[i];
            a.chunks.insert(Dimension::Overworld, ChunkPos::new(xs[i], 0));
            a
        };
        let (a, b, c) = (make(0), make(1), make(2));

        let mut left = Accum::default();
        {
            let mut ab = Accum::default();
            a.clone().merge(&mut ab);
            b.clone().merge(&mut ab);
            ab.merge(&mut left);
            c.clone().merge(&mut left);
        }
        let mut right = Accum::default();
        {
            let mut bc = Accum::default();
            b.merge(&mut bc);
            c.merge(&mut bc);
            a.merge(&mut right);
            bc.merge(&mut right);
        }
        prop_assert_eq!(left.records_seen, right.records_seen);
        prop_assert_eq!(left.chunks.total_chunks(), right.chunks.total_chunks());
        let l: Vec<_> = left.chunks.regions_in(Dimension::Overworld);
        let r: Vec<_> = right.chunks.regions_in(Dimension::Overworld);
        prop_assert_eq!(l, r);
    }
}
