//! Lock-free parallel scan of an ordered key space.
#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, warn};
use strata_core::{Result, Status};
use strata_store::KvStore;

/// Fixed partition count: one per leading key byte.
pub const PARTITIONS: usize = 256;

const ABORT_CHECK_INTERVAL: u64 = 1024;

/// Result of a full key-space scan: the merged accumulator plus every
/// partition's failure, if any. Errors are accumulated, never
/// short-circuited, so callers see each partition's outcome.
pub struct ScanOutcome<A> {
    pub accum: A,
    pub partition_errors: Vec<(u8, Status)>,
    pub aborted: bool,
}

impl<A> ScanOutcome<A> {
    /// Collapse into a single result: the first partition error wins
    /// the kind, the rest are appended to its trail.
    pub fn into_result(self) -> Result<A> {
        if self.aborted && self.partition_errors.is_empty() {
            return Err(Status::cancelled().push("key-space scan"));
        }
        let mut errors = self.partition_errors.into_iter();
        match errors.next() {
            None => Ok(self.accum),
            Some((first_p, first)) => {
                let mut status = first.push(format!("partition {first_p:#04x}"));
                for (p, e) in errors {
                    status = status.push(format!(
                        "partition {p:#04x} also failed: {}",
                        e.root_cause()
                    ));
                }
                Err(status.push("key-space scan"))
            }
        }
    }
}

/// Scan the whole store once, in parallel, into one accumulator.
///
/// The key space is split into [`PARTITIONS`] disjoint first-byte
/// ranges. Each worker claims partitions off a shared counter, opens
/// its own iterator, accumulates into a partition-local value, then
/// folds it into the running total under a mutex: merges serialize,
/// scans don't. `accept` sees keys in order within one partition but
/// partitions complete in any order.
pub fn scan<A, Z, F, M>(
    store: &dyn KvStore,
    pool: &rayon::ThreadPool,
    concurrency: usize,
    zero: Z,
    accept: F,
    merge: M,
    abort: &AtomicBool,
) -> ScanOutcome<A>
where
    A: Send,
    Z: Fn() -> A + Sync,
    F: Fn(&[u8], &[u8], &mut A) + Sync,
    M: Fn(A, &mut A) + Sync,
{
    let total = Mutex::new(zero());
    let errors: Mutex<Vec<(u8, Status)>> = Mutex::new(Vec::new());
    let next = AtomicUsize::new(0);

    let workers = concurrency.max(1);
    pool.in_place_scope(|s| {
        for _ in 0..workers {
            let total = &total;
            let errors = &errors;
            let next = &next;
            let zero = &zero;
            let accept = &accept;
            let merge = &merge;
            s.spawn(move |_| {
                loop {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let p = next.fetch_add(1, Ordering::Relaxed);
                    if p >= PARTITIONS {
                        break;
                    }
                    let prefix = p as u8;
                    let mut local = zero();
                    if let Err(e) = scan_partition(store, prefix, accept, &mut local, abort) {
                        warn!("partition {prefix:#04x} failed: {e}");
                        errors.lock().unwrap().push((prefix, e));
                    }
                    // Partial accumulators still merge; the error report
                    // tells the caller which partitions are incomplete.
                    merge(local, &mut total.lock().unwrap());
                }
            });
        }
    });

    let outcome = ScanOutcome {
        accum: total.into_inner().unwrap(),
        partition_errors: errors.into_inner().unwrap(),
        aborted: abort.load(Ordering::Relaxed),
    };
    debug!(
        "scan finished: {} partition error(s), aborted={}",
        outcome.partition_errors.len(),
        outcome.aborted
    );
    outcome
}

fn scan_partition<A>(
    store: &dyn KvStore,
    prefix: u8,
    accept: &(impl Fn(&[u8], &[u8], &mut A) + Sync),
    local: &mut A,
    abort: &AtomicBool,
) -> Result<()> {
    let mut iter = store.iter_from(&[prefix])?;
    let mut seen: u64 = 0;
    while let Some((key, value)) = iter.next()? {
        if key.first() != Some(&prefix) {
            break;
        }
        accept(&key, &value, local);
        seen += 1;
        if seen % ABORT_CHECK_INTERVAL == 0 && abort.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(())
}
