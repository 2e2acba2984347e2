//! Spatially-scheduled post-conversion passes over written region files.
#![forbid(unsafe_code)]

mod queue2d;
#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use fastnbt::Value;
use log::{debug, info};
use strata_core::{ChunkPos, Dimension, Progress, RegionPos, Result, Status};
use strata_ctx::ChunksInRegion;
use strata_ctx::record;
use strata_region::RegionWindow;

pub use queue2d::{Next, Queue2d};

/// A pass run once per region after conversion, with exclusive access
/// to the region and everything within its lock radius.
pub trait TerraformPass: Send + Sync {
    fn name(&self) -> &str;

    /// Chebyshev radius of regions this pass may touch around the one
    /// it was handed. Zero means the pass stays inside its own region.
    fn lock_radius(&self) -> i32;

    /// Regions can hold upwards of a thousand chunks, so passes are
    /// expected to poll `abort` between chunks and bail with
    /// [`Status::cancelled`] rather than finish the whole cell.
    fn region(
        &self,
        dim: Dimension,
        region: RegionPos,
        chunks: &BTreeSet<ChunkPos>,
        window: &mut RegionWindow,
        abort: &AtomicBool,
    ) -> Result<()>;
}

/// Clears the light-populated marker on every converted chunk so the
/// game recomputes lighting on first load. Reads neighbor chunks to
/// decide whether a chunk sits on the populated frontier, which is why
/// it asks for a lock radius of one.
pub struct RelightPass;

impl TerraformPass for RelightPass {
    fn name(&self) -> &str {
        "relight"
    }

    fn lock_radius(&self) -> i32 {
        1
    }

    fn region(
        &self,
        dim: Dimension,
        region: RegionPos,
        chunks: &BTreeSet<ChunkPos>,
        window: &mut RegionWindow,
        abort: &AtomicBool,
    ) -> Result<()> {
        for &pos in chunks {
            if abort.load(Ordering::Relaxed) {
                return Err(Status::cancelled());
            }
            let Some(mut rec) = window.chunk(pos)? else {
                continue;
            };
            // A chunk with all four written neighbors gets relit lazily
            // by the game; a frontier chunk is forced to recompute
            // immediately so light does not bleed from void neighbors.
            let mut frontier = false;
            for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                let next = ChunkPos {
                    x: pos.x + dx,
                    z: pos.z + dz,
                };
                if !window.contains(next)? {
                    frontier = true;
                    break;
                }
            }
            record::set(&mut rec, "isLightOn", Value::Byte(0));
            if frontier {
                record::set(&mut rec, "forced_relight", Value::Byte(1));
            } else {
                record::remove(&mut rec, "forced_relight");
            }
            window.update(pos, &rec)?;
            window.evict_outside(pos.region(), self.lock_radius())?;
        }
        debug!(
            "relit {} chunk(s) of {} {}",
            chunks.len(),
            dim,
            region.file_name()
        );
        Ok(())
    }
}

/// Runs `pass` over every written region, one dimension at a time.
///
/// Regions are handed to workers by a [`Queue2d`] keyed on chunk count,
/// so the densest areas go first and no two workers ever hold regions
/// within the lock radius of each other. `lock_radius` widens the
/// exclusion zone beyond what the pass itself requires; it is never
/// allowed to shrink it. Returns the number of regions processed.
pub fn run_terraform_stage(
    chunks: &ChunksInRegion,
    out_root: &Path,
    pass: &dyn TerraformPass,
    lock_radius: i32,
    pool: &rayon::ThreadPool,
    concurrency: usize,
    abort: &AtomicBool,
    progress: &dyn Progress,
) -> Result<u64> {
    let radius = lock_radius.max(pass.lock_radius());
    let total = chunks.region_count() as u64;
    let done = AtomicU64::new(0);
    let first_error: Mutex<Option<Status>> = Mutex::new(None);

    for dim in chunks.dimensions() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        let cells: Vec<(RegionPos, f32)> = chunks
            .regions_in(dim)
            .into_iter()
            .map(|r| {
                let weight = chunks.chunks(dim, r).map_or(0, BTreeSet::len) as f32;
                (r, weight)
            })
            .collect();
        let queue = Mutex::new(Queue2d::new(radius, cells));

        pool.in_place_scope(|s| {
            for _ in 0..concurrency.max(1) {
                s.spawn(|_| {
                    loop {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        let next = queue.lock().unwrap().next();
                        let region = match next {
                            Next::Done => break,
                            Next::Busy => {
                                std::thread::sleep(Duration::from_millis(10));
                                continue;
                            }
                            Next::Cell(region) => region,
                        };
                        let res = match chunks.chunks(dim, region) {
                            Some(set) => {
                                let mut window = RegionWindow::new(out_root, dim);
                                pass.region(dim, region, set, &mut window, abort)
                                    .and_then(|()| window.flush())
                            }
                            None => Ok(()),
                        };
                        queue.lock().unwrap().unlock_around(region);
                        if let Err(e) = res {
                            abort.store(true, Ordering::Relaxed);
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e.push(format!(
                                    "{} pass over {} {}",
                                    pass.name(),
                                    dim,
                                    region.file_name()
                                )));
                            }
                            break;
                        }
                        let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                        if !progress.report(n, total) {
                            abort.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                });
            }
        });
    }

    if let Some(err) = first_error.lock().unwrap().take() {
        return Err(err);
    }
    if abort.load(Ordering::Relaxed) {
        return Err(Status::cancelled().push(format!("{} pass", pass.name())));
    }
    let processed = done.load(Ordering::Relaxed);
    info!(
        "terraform {} pass finished over {} region(s)",
        pass.name(),
        processed
    );
    Ok(processed)
}
