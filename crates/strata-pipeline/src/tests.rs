use std::io::Read as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fastnbt::Value;
use strata_core::{ChunkPos, Dimension, NullProgress, Progress, RegionPos};
use strata_ctx::{Record, record};
use strata_region::RegionFile;
use strata_store::{ChunkKey, RecordTag};
use strata_vfs::DiskFs;

use crate::{ConversionPipeline, Dialect, PipelineOptions, Summary};

fn to_bytes(rec: &Record) -> Vec<u8> {
    fastnbt::to_bytes(rec).unwrap()
}

fn entity(id: u128, extra: Vec<(&str, Value)>) -> Record {
    let mut rec = record::compound(extra);
    record::set_entity_uuid(&mut rec, id);
    rec
}

#[derive(Default)]
struct WorldBuilder {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WorldBuilder {
    fn chunk(&mut self, dim: Dimension, pos: ChunkPos) -> &mut Self {
        self.pairs
            .push((ChunkKey::new(dim, pos, RecordTag::Version).encode(), vec![40]));
        let sub = ChunkKey {
            pos,
            dimension: dim,
            tag: RecordTag::SubChunk,
            subchunk: Some(0),
        };
        let section = record::compound(vec![("blocks", Value::Int(1))]);
        self.pairs.push((sub.encode(), to_bytes(&section)));
        self
    }

    fn entities(&mut self, dim: Dimension, pos: ChunkPos, list: Vec<Record>) -> &mut Self {
        let key = ChunkKey::new(dim, pos, RecordTag::Entities).encode();
        let rec = record::compound(vec![("list", Value::List(list))]);
        self.pairs.push((key, to_bytes(&rec)));
        self
    }

    fn block_entities(&mut self, dim: Dimension, pos: ChunkPos, list: Vec<Record>) -> &mut Self {
        let key = ChunkKey::new(dim, pos, RecordTag::BlockEntities).encode();
        let rec = record::compound(vec![("list", Value::List(list))]);
        self.pairs.push((key, to_bytes(&rec)));
        self
    }

    fn player(&mut self, rec: &Record) -> &mut Self {
        self.pairs.push((b"~local_player".to_vec(), to_bytes(rec)));
        self
    }

    fn map(&mut self, id: i64, rec: &Record) -> &mut Self {
        self.pairs
            .push((format!("map_{id}").into_bytes(), to_bytes(rec)));
        self
    }

    fn build(&mut self, source: &Path) {
        strata_store::TableStore::create(&DiskFs, &source.join("db"), self.pairs.clone())
            .unwrap();
    }
}

fn run(source: &Path, output: &Path) -> strata_core::Result<Summary> {
    run_with(source, output, &NullProgress)
}

fn run_with(
    source: &Path,
    output: &Path,
    progress: &dyn Progress,
) -> strata_core::Result<Summary> {
    let options = PipelineOptions {
        concurrency: 2,
        lock_radius: 1,
        dialect: Dialect::Passthrough,
        temp_root: String::new(),
    };
    ConversionPipeline::new(source.to_path_buf(), output.to_path_buf(), options).run(progress)
}

fn load_region(output: &Path, dim: Dimension, x: i32, z: i32) -> RegionFile {
    let path = output
        .join(dim.dir_name())
        .join(RegionPos { x, z }.file_name());
    RegionFile::load(&path).unwrap()
}

fn read_level_dat(output: &Path) -> Record {
    let raw = std::fs::read(output.join("level.dat")).unwrap();
    let mut dec = flate2::read::GzDecoder::new(raw.as_slice());
    let mut bytes = Vec::new();
    dec.read_to_end(&mut bytes).unwrap();
    fastnbt::from_bytes(&bytes).unwrap()
}

fn chunk_entities(region: &RegionFile, lx: i32, lz: i32) -> Vec<Value> {
    let chunk = region.extract(lx, lz).unwrap().unwrap();
    match record::get(&chunk, "entities") {
        Some(Value::List(list)) => list.clone(),
        _ => Vec::new(),
    }
}

#[test]
fn converts_a_small_world_end_to_end() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let lodestone = record::compound(vec![
        ("id", Value::String("minecraft:lodestone".to_string())),
        ("x", Value::Int(4)),
        ("y", Value::Int(64)),
        ("z", Value::Int(9)),
    ]);
    let map = record::compound(vec![
        ("scale", Value::Byte(1)),
        ("dimension", Value::Byte(0)),
        ("xCenter", Value::Int(128)),
        ("zCenter", Value::Int(-64)),
        (
            "colors",
            Value::ByteArray(fastnbt::ByteArray::new(vec![1, 2, 3, 4])),
        ),
    ]);
    let player = entity(
        0xfeed,
        vec![(
            "ShoulderEntityLeft",
            record::compound(vec![("id", Value::String("minecraft:parrot".to_string()))]),
        )],
    );
    WorldBuilder::default()
        .chunk(Dimension::Overworld, ChunkPos::new(0, 0))
        .chunk(Dimension::Overworld, ChunkPos::new(1, 0))
        .chunk(Dimension::Overworld, ChunkPos::new(40, 5))
        .chunk(Dimension::Nether, ChunkPos::new(5, 5))
        .block_entities(Dimension::Overworld, ChunkPos::new(0, 0), vec![lodestone])
        .map(7, &map)
        .player(&player)
        .build(src.path());

    let summary = run(src.path(), out.path()).unwrap();
    assert_eq!(summary.chunks_written, 4);
    assert_eq!(summary.regions_written, 3);
    assert_eq!(summary.maps, 1);
    assert_eq!(summary.lodestones, 1);
    assert_eq!(summary.block_entities, 1);

    // Conversion plus the relight pass both ran over every chunk.
    let r00 = load_region(out.path(), Dimension::Overworld, 0, 0);
    let chunk = r00.extract(0, 0).unwrap().unwrap();
    assert_eq!(record::get(&chunk, "isLightOn"), Some(&Value::Byte(0)));
    match record::get(&chunk, "block_entities") {
        Some(Value::List(list)) => assert_eq!(list.len(), 1),
        other => panic!("missing block entities: {other:?}"),
    }
    assert!(load_region(out.path(), Dimension::Overworld, 1, 0).contains(8, 5));
    assert!(load_region(out.path(), Dimension::Nether, 0, 0).contains(5, 5));

    assert!(out.path().join("data/map_7.dat").exists());
    assert!(out.path().join("data/lodestones.dat").exists());

    let level = read_level_dat(out.path());
    let data = record::get(&level, "Data").unwrap();
    let player = record::get(data, "Player").unwrap();
    assert!(record::get(player, "ShoulderEntityLeft").is_some());
    assert!(matches!(
        record::get(data, "enabled_features"),
        Some(Value::List(_))
    ));

    // The sandbox shadowed the open-time lock write; the source tree
    // is untouched.
    assert!(!src.path().join("db/LOCK").exists());
}

#[test]
fn stitches_leash_and_vehicle_across_regions() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let leashed = entity(
        0xa1,
        vec![(
            "Leash",
            record::compound(vec![
                ("x", Value::Int(1)),
                ("y", Value::Int(70)),
                ("z", Value::Int(3)),
            ]),
        )],
    );
    let vehicle_id: u128 = 0xb2;
    let passenger = entity(
        0xc3,
        vec![(
            "Vehicle",
            Value::IntArray(fastnbt::IntArray::new(
                record::uuid_to_int_array(vehicle_id).to_vec(),
            )),
        )],
    );
    let vehicle = entity(
        vehicle_id,
        vec![("id", Value::String("minecraft:minecart".to_string()))],
    );
    WorldBuilder::default()
        .chunk(Dimension::Overworld, ChunkPos::new(0, 0))
        .chunk(Dimension::Overworld, ChunkPos::new(31, 0))
        .chunk(Dimension::Overworld, ChunkPos::new(32, 0))
        .entities(Dimension::Overworld, ChunkPos::new(0, 0), vec![leashed])
        .entities(Dimension::Overworld, ChunkPos::new(31, 0), vec![passenger])
        .entities(Dimension::Overworld, ChunkPos::new(32, 0), vec![vehicle])
        .build(src.path());

    let summary = run(src.path(), out.path()).unwrap();
    assert_eq!(summary.leashes_stitched, 1);
    assert_eq!(summary.vehicles_stitched, 1);
    assert_eq!(summary.unresolved_links, 0);

    let r00 = load_region(out.path(), Dimension::Overworld, 0, 0);
    let leashed = &chunk_entities(&r00, 0, 0)[0];
    let leash = record::get(leashed, "leash").unwrap();
    assert_eq!(record::get_i32(leash, "X"), Some(1));
    assert_eq!(record::get_i32(leash, "Z"), Some(3));

    // The passenger moved out of its own chunk and under the vehicle
    // one region over.
    assert!(chunk_entities(&r00, 31, 0).is_empty());
    let r10 = load_region(out.path(), Dimension::Overworld, 1, 0);
    let vehicle = &chunk_entities(&r10, 0, 0)[0];
    match record::get(vehicle, "Passengers") {
        Some(Value::List(list)) => {
            assert_eq!(list.len(), 1);
            assert_eq!(record::entity_uuid(&list[0]), Some(0xc3));
        }
        other => panic!("missing passengers: {other:?}"),
    }
}

#[test]
fn root_vehicle_is_relocated_under_the_player() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let vehicle_id: u128 = 0xbeef;
    let boat = entity(
        vehicle_id,
        vec![("id", Value::String("minecraft:boat".to_string()))],
    );
    // The captured copy is a stub; the live record on disk must win.
    let player = entity(
        0x1,
        vec![(
            "RootVehicle",
            record::compound(vec![
                (
                    "Attach",
                    Value::IntArray(fastnbt::IntArray::new(
                        record::uuid_to_int_array(vehicle_id).to_vec(),
                    )),
                ),
                ("Entity", entity(vehicle_id, Vec::new())),
            ]),
        )],
    );
    WorldBuilder::default()
        .chunk(Dimension::Overworld, ChunkPos::new(2, 2))
        .entities(Dimension::Overworld, ChunkPos::new(2, 2), vec![boat])
        .player(&player)
        .build(src.path());

    run(src.path(), out.path()).unwrap();

    let r00 = load_region(out.path(), Dimension::Overworld, 0, 0);
    assert!(chunk_entities(&r00, 2, 2).is_empty());

    let level = read_level_dat(out.path());
    let data = record::get(&level, "Data").unwrap();
    let player = record::get(data, "Player").unwrap();
    let root = record::get(player, "RootVehicle").unwrap();
    let nested = record::get(root, "Entity").unwrap();
    assert_eq!(record::entity_uuid(nested), Some(vehicle_id));
    assert_eq!(record::get_str(nested, "id"), Some("minecraft:boat"));
}

#[test]
fn missing_source_store_fails_with_a_trail() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let err = run(src.path(), out.path()).unwrap_err();
    assert!(err.to_string().contains("opening source store"));
}

struct CancelAfter {
    seen: AtomicU64,
    after: u64,
}

impl Progress for CancelAfter {
    fn report(&self, _done: u64, _total: u64) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed) < self.after
    }
}

#[test]
fn progress_cancellation_aborts_the_run() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut world = WorldBuilder::default();
    for rx in 0..4 {
        world.chunk(Dimension::Overworld, ChunkPos::new(rx * 32, 0));
    }
    world.build(src.path());

    let progress = CancelAfter {
        seen: AtomicU64::new(0),
        after: 1,
    };
    let err = run_with(src.path(), out.path(), &progress).unwrap_err();
    assert!(err.is_cancelled());
}
