use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use fastnbt::Value;
use proptest::prelude::*;
use strata_core::{ChunkPos, Dimension, NullProgress, RegionPos};
use strata_ctx::{ChunksInRegion, record};
use strata_region::{RegionFile, RegionWindow};

use crate::{Next, Queue2d, RelightPass, TerraformPass, run_terraform_stage};

fn pool(threads: usize) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .unwrap()
}

fn r(x: i32, z: i32) -> RegionPos {
    RegionPos { x, z }
}

#[test]
fn empty_queue_is_done() {
    let mut q = Queue2d::new(1, Vec::new());
    assert_eq!(q.next(), Next::Done);
}

#[test]
fn single_cell_then_done() {
    let mut q = Queue2d::new(0, vec![(r(5, -3), 1.0)]);
    assert_eq!(q.next(), Next::Cell(r(5, -3)));
    q.unlock_around(r(5, -3));
    assert_eq!(q.next(), Next::Done);
}

#[test]
fn densest_neighborhood_goes_first() {
    // Heavy cluster on the right, lone light cell far left.
    let cells = vec![
        (r(0, 0), 1.0),
        (r(10, 0), 4.0),
        (r(11, 0), 5.0),
        (r(10, 1), 6.0),
    ];
    let mut q = Queue2d::new(1, cells);
    // (11, 0) sees 4 + 5 + 6 = 15, the heaviest window.
    assert_eq!(q.next(), Next::Cell(r(11, 0)));
}

#[test]
fn locked_neighborhood_reports_busy() {
    let cells: Vec<(RegionPos, f32)> = (0..3)
        .flat_map(|x| (0..3).map(move |z| (r(x, z), 1.0)))
        .collect();
    let mut q = Queue2d::new(1, cells);
    assert_eq!(q.next(), Next::Cell(r(1, 1)));
    // Every remaining cell is within radius one of the locked block.
    assert_eq!(q.next(), Next::Busy);
    q.unlock_around(r(1, 1));
    assert!(matches!(q.next(), Next::Cell(_)));
}

#[test]
fn zero_radius_never_blocks_neighbors() {
    let cells: Vec<(RegionPos, f32)> = (0..3).map(|x| (r(x, 0), 1.0)).collect();
    let mut q = Queue2d::new(0, cells);
    let mut handed = BTreeSet::new();
    for _ in 0..3 {
        match q.next() {
            Next::Cell(c) => {
                assert!(handed.insert((c.x, c.z)));
            }
            other => panic!("expected a cell, got {other:?}"),
        }
    }
    assert_eq!(q.next(), Next::Done);
}

#[test]
fn drain_hands_out_every_cell_exactly_once() {
    let cells: Vec<(RegionPos, f32)> = (-2..4)
        .flat_map(|x| (-1..5).map(move |z| (r(x, z), (x + z) as f32 + 10.0)))
        .collect();
    let expect = cells.len();
    let mut q = Queue2d::new(2, cells);
    let mut handed = BTreeSet::new();
    loop {
        match q.next() {
            Next::Cell(c) => {
                assert!(handed.insert((c.x, c.z)), "cell {c:?} handed out twice");
                q.unlock_around(c);
            }
            Next::Busy => panic!("busy with no cell held"),
            Next::Done => break,
        }
    }
    assert_eq!(handed.len(), expect);
}

proptest! {
    // Hold up to `hold` cells at once, releasing the oldest when full.
    // Any two simultaneously held cells must sit more than twice the
    // radius apart or their locked neighborhoods would overlap.
    #[test]
    fn held_cells_never_overlap(
        radius in 0i32..3,
        hold in 1usize..4,
        coords in proptest::collection::btree_set((0i32..8, 0i32..8), 1..40),
    ) {
        let cells: Vec<(RegionPos, f32)> =
            coords.iter().map(|&(x, z)| (r(x, z), 1.0)).collect();
        let total = cells.len();
        let mut q = Queue2d::new(radius, cells);
        let mut held: Vec<RegionPos> = Vec::new();
        let mut handed = 0usize;
        loop {
            match q.next() {
                Next::Cell(c) => {
                    for other in &held {
                        prop_assert!(
                            c.chebyshev(*other) > 2 * radius,
                            "{c:?} and {other:?} held together at radius {radius}"
                        );
                    }
                    held.push(c);
                    handed += 1;
                    if held.len() >= hold {
                        q.unlock_around(held.remove(0));
                    }
                }
                Next::Busy => {
                    prop_assert!(!held.is_empty(), "busy while nothing is held");
                    q.unlock_around(held.remove(0));
                }
                Next::Done => break,
            }
        }
        prop_assert_eq!(handed, total);
    }
}

struct TrackingPass {
    radius: i32,
    active: Mutex<Vec<RegionPos>>,
    overlaps: AtomicUsize,
    seen: Mutex<Vec<RegionPos>>,
}

impl TrackingPass {
    fn new(radius: i32) -> Self {
        Self {
            radius,
            active: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl TerraformPass for TrackingPass {
    fn name(&self) -> &str {
        "tracking"
    }

    fn lock_radius(&self) -> i32 {
        self.radius
    }

    fn region(
        &self,
        _dim: Dimension,
        region: RegionPos,
        _chunks: &BTreeSet<ChunkPos>,
        _window: &mut RegionWindow,
        _abort: &AtomicBool,
    ) -> strata_core::Result<()> {
        {
            let mut active = self.active.lock().unwrap();
            for other in active.iter() {
                if region.chebyshev(*other) <= 2 * self.radius {
                    self.overlaps.fetch_add(1, Ordering::Relaxed);
                }
            }
            active.push(region);
        }
        // Linger so concurrent workers genuinely overlap in time.
        std::thread::sleep(Duration::from_millis(5));
        self.active.lock().unwrap().retain(|c| *c != region);
        self.seen.lock().unwrap().push(region);
        Ok(())
    }
}

fn grid_chunks(dim: Dimension, side: i32) -> ChunksInRegion {
    let mut chunks = ChunksInRegion::default();
    for rx in 0..side {
        for rz in 0..side {
            // Uneven counts so queue weights differ per region.
            for i in 0..=(rx + rz) {
                chunks.insert(dim, r(rx, rz).chunk_at(i % 32, i / 32));
            }
        }
    }
    chunks
}

#[test]
fn eight_workers_on_a_three_by_three_grid_never_collide() {
    let chunks = grid_chunks(Dimension::Overworld, 3);
    let out = tempfile::tempdir().unwrap();
    let pass = TrackingPass::new(1);
    let abort = AtomicBool::new(false);
    let processed = run_terraform_stage(
        &chunks,
        out.path(),
        &pass,
        1,
        &pool(8),
        8,
        &abort,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(processed, 9);
    assert_eq!(pass.overlaps.load(Ordering::Relaxed), 0);
    let mut seen = pass.seen.lock().unwrap().clone();
    seen.sort_by_key(|c| (c.x, c.z));
    let expect: Vec<RegionPos> = (0..3)
        .flat_map(|x| (0..3).map(move |z| r(x, z)))
        .collect();
    assert_eq!(seen, expect);
}

#[test]
fn stage_covers_every_dimension() {
    let mut chunks = grid_chunks(Dimension::Overworld, 2);
    chunks.insert(Dimension::Nether, ChunkPos { x: -40, z: 7 });
    let out = tempfile::tempdir().unwrap();
    let pass = TrackingPass::new(1);
    let abort = AtomicBool::new(false);
    let processed = run_terraform_stage(
        &chunks,
        out.path(),
        &pass,
        1,
        &pool(4),
        4,
        &abort,
        &NullProgress,
    )
    .unwrap();
    assert_eq!(processed, 5);
}

struct FailingPass;

impl TerraformPass for FailingPass {
    fn name(&self) -> &str {
        "failing"
    }

    fn lock_radius(&self) -> i32 {
        1
    }

    fn region(
        &self,
        _dim: Dimension,
        _region: RegionPos,
        _chunks: &BTreeSet<ChunkPos>,
        _window: &mut RegionWindow,
        _abort: &AtomicBool,
    ) -> strata_core::Result<()> {
        Err(strata_core::Status::io("disk on fire"))
    }
}

#[test]
fn pass_failure_aborts_the_stage() {
    let chunks = grid_chunks(Dimension::Overworld, 3);
    let out = tempfile::tempdir().unwrap();
    let abort = AtomicBool::new(false);
    let err = run_terraform_stage(
        &chunks,
        out.path(),
        &FailingPass,
        1,
        &pool(2),
        2,
        &abort,
        &NullProgress,
    )
    .unwrap_err();
    assert_eq!(err.root_cause(), "disk on fire");
    assert!(err.to_string().contains("failing pass"));
    assert!(abort.load(Ordering::Relaxed));
}

struct HaltingPass {
    halt_after: usize,
    chunks_done: AtomicUsize,
}

impl TerraformPass for HaltingPass {
    fn name(&self) -> &str {
        "halting"
    }

    fn lock_radius(&self) -> i32 {
        0
    }

    fn region(
        &self,
        _dim: Dimension,
        _region: RegionPos,
        chunks: &BTreeSet<ChunkPos>,
        _window: &mut RegionWindow,
        abort: &AtomicBool,
    ) -> strata_core::Result<()> {
        for _ in chunks {
            if abort.load(Ordering::Relaxed) {
                return Err(strata_core::Status::cancelled());
            }
            let done = self.chunks_done.fetch_add(1, Ordering::Relaxed) + 1;
            if done == self.halt_after {
                abort.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[test]
fn cancellation_lands_between_chunks_of_one_region() {
    // One dense region; the flag flips while the pass is partway
    // through it, and the pass must stop there instead of draining
    // the whole cell first.
    let mut chunks = ChunksInRegion::default();
    for i in 0..64 {
        chunks.insert(Dimension::Overworld, r(0, 0).chunk_at(i % 32, i / 32));
    }
    let out = tempfile::tempdir().unwrap();
    let pass = HaltingPass {
        halt_after: 3,
        chunks_done: AtomicUsize::new(0),
    };
    let abort = AtomicBool::new(false);
    let err = run_terraform_stage(
        &chunks,
        out.path(),
        &pass,
        0,
        &pool(1),
        1,
        &abort,
        &NullProgress,
    )
    .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(pass.chunks_done.load(Ordering::Relaxed), 3);
}

fn lit_chunk(x: i32, z: i32) -> Value {
    record::compound(vec![
        ("xPos", Value::Int(x)),
        ("zPos", Value::Int(z)),
        ("isLightOn", Value::Byte(1)),
    ])
}

#[test]
fn relight_clears_light_and_flags_the_frontier() {
    let out = tempfile::tempdir().unwrap();
    let dim_dir = out.path().join(Dimension::Overworld.dir_name());
    std::fs::create_dir_all(&dim_dir).unwrap();

    // A 3x3 block of chunks; only (1, 1) has all four neighbors.
    let mut file = RegionFile::new();
    let mut chunks = ChunksInRegion::default();
    for x in 0..3 {
        for z in 0..3 {
            file.insert(x, z, &lit_chunk(x, z)).unwrap();
            chunks.insert(Dimension::Overworld, ChunkPos { x, z });
        }
    }
    file.save(&dim_dir.join(r(0, 0).file_name())).unwrap();

    let abort = AtomicBool::new(false);
    run_terraform_stage(
        &chunks,
        out.path(),
        &RelightPass,
        1,
        &pool(2),
        2,
        &abort,
        &NullProgress,
    )
    .unwrap();

    let file = RegionFile::load(&dim_dir.join(r(0, 0).file_name())).unwrap();
    for x in 0..3 {
        for z in 0..3 {
            let rec = file.extract(x, z).unwrap().unwrap();
            assert_eq!(record::get(&rec, "isLightOn"), Some(&Value::Byte(0)));
            let frontier = record::get(&rec, "forced_relight").is_some();
            assert_eq!(frontier, !(x == 1 && z == 1), "chunk ({x}, {z})");
        }
    }
}

#[test]
fn relight_stops_at_the_chunk_boundary_when_cancelled() {
    let out = tempfile::tempdir().unwrap();
    let dim_dir = out.path().join(Dimension::Overworld.dir_name());
    std::fs::create_dir_all(&dim_dir).unwrap();
    let mut file = RegionFile::new();
    file.insert(0, 0, &lit_chunk(0, 0)).unwrap();
    file.save(&dim_dir.join(r(0, 0).file_name())).unwrap();

    let mut set = BTreeSet::new();
    set.insert(ChunkPos { x: 0, z: 0 });
    let abort = AtomicBool::new(true);
    let mut window = RegionWindow::new(out.path(), Dimension::Overworld);
    let err = RelightPass
        .region(Dimension::Overworld, r(0, 0), &set, &mut window, &abort)
        .unwrap_err();
    assert!(err.is_cancelled());

    // Nothing was touched once the flag went up.
    let file = RegionFile::load(&dim_dir.join(r(0, 0).file_name())).unwrap();
    let rec = file.extract(0, 0).unwrap().unwrap();
    assert_eq!(record::get(&rec, "isLightOn"), Some(&Value::Byte(1)));
}
