use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fastnbt::Value;
use log::{debug, info, warn};
use strata_core::{ChunkPos, Dimension, Progress, Result, Status, StatusExt};
use strata_ctx::{Context, Converter, Record, WorkItem, harvest_relationships, record};
use strata_store::{ChunkKey, KvStore, RecordTag};

use crate::RegionFile;

#[derive(Clone, Copy, Debug, Default)]
pub struct RegionStageStats {
    pub regions: u64,
    pub chunks: u64,
    pub entities: u64,
    pub block_entities: u64,
    pub skipped_records: u64,
}

#[derive(Default)]
struct ChunkSources {
    sections: Vec<(u8, Value)>,
    block_entities: Vec<Value>,
    entities: Vec<Value>,
    skipped: u64,
    found_any: bool,
}

/// Leading key bytes shared by every record of one chunk.
fn chunk_prefix(dim: Dimension, pos: ChunkPos) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&pos.x.to_le_bytes());
    out.extend_from_slice(&pos.z.to_le_bytes());
    if dim != Dimension::Overworld {
        out.extend_from_slice(&dim.id().to_le_bytes());
    }
    out
}

fn decode_compound(value: &[u8]) -> Result<Record> {
    fastnbt::from_bytes(value).map_err(|e| Status::malformed(e.to_string()))
}

/// Entries of the `list` field of a gathered record.
fn take_list(rec: Record) -> Vec<Value> {
    let mut rec = rec;
    match record::remove(&mut rec, "list") {
        Some(Value::List(items)) => items,
        _ => Vec::new(),
    }
}

fn gather_chunk(
    store: &dyn KvStore,
    dim: Dimension,
    pos: ChunkPos,
) -> Result<ChunkSources> {
    let prefix = chunk_prefix(dim, pos);
    let mut sources = ChunkSources::default();
    let mut iter = store.iter_from(&prefix)?;
    while let Some((key, value)) = iter.next()? {
        if !key.starts_with(&prefix) {
            break;
        }
        let Some(ck) = ChunkKey::parse(&key) else {
            continue;
        };
        // An overworld prefix is a strict prefix of other-dimension keys
        // for the same column; the parsed dimension disambiguates.
        if ck.pos != pos || ck.dimension != dim {
            continue;
        }
        sources.found_any = true;
        match ck.tag {
            RecordTag::SubChunk => match decode_compound(&value) {
                Ok(section) => sources
                    .sections
                    .push((ck.subchunk.unwrap_or_default(), section)),
                Err(e) => {
                    warn!("skipping malformed subchunk {:?} of {dim} ({}, {}): {e}",
                        ck.subchunk, pos.x, pos.z);
                    sources.skipped += 1;
                }
            },
            RecordTag::BlockEntities => match decode_compound(&value) {
                Ok(rec) => sources.block_entities.extend(take_list(rec)),
                Err(e) => {
                    warn!("skipping malformed block entities of {dim} ({}, {}): {e}", pos.x, pos.z);
                    sources.skipped += 1;
                }
            },
            RecordTag::Entities => match decode_compound(&value) {
                Ok(rec) => sources.entities.extend(take_list(rec)),
                Err(e) => {
                    warn!("skipping malformed entities of {dim} ({}, {}): {e}", pos.x, pos.z);
                    sources.skipped += 1;
                }
            },
            RecordTag::Version
            | RecordTag::Data2d
            | RecordTag::Finalized
            | RecordTag::Other(_) => {}
        }
    }
    sources.sections.sort_by_key(|(y, _)| *y);
    Ok(sources)
}

struct ConvertedChunk {
    record: Record,
    entities: u64,
    block_entities: u64,
    skipped: u64,
}

fn convert_one_chunk(
    store: &dyn KvStore,
    converter: &dyn Converter,
    dim: Dimension,
    pos: ChunkPos,
    ctx: &mut Context,
) -> Result<Option<ConvertedChunk>> {
    let sources = gather_chunk(store, dim, pos)?;
    if !sources.found_any {
        return Ok(None);
    }
    let mut skipped = sources.skipped;

    let sections: Vec<Value> = sources
        .sections
        .into_iter()
        .map(|(y, mut section)| {
            record::set(&mut section, "Y", Value::Byte(y as i8));
            section
        })
        .collect();
    let composed = record::compound(vec![
        ("xPos", Value::Int(pos.x)),
        ("zPos", Value::Int(pos.z)),
        ("sections", Value::List(sections)),
    ]);
    let mut dest = converter.convert_chunk(dim, pos, composed, ctx)?;

    let mut out_block_entities = Vec::new();
    for be in sources.block_entities {
        let Some(be_pos) = record::block_pos(&be) else {
            warn!("skipping block entity without position in {dim} ({}, {})", pos.x, pos.z);
            skipped += 1;
            continue;
        };
        let block = record::get_str(&be, "id").unwrap_or_default().to_string();
        out_block_entities.push(converter.convert_block_entity(be_pos, &block, be, ctx));
    }
    let block_entity_count = out_block_entities.len() as u64;
    record::set(&mut dest, "block_entities", Value::List(out_block_entities));

    let mut out_entities = Vec::new();
    for entity in sources.entities {
        let converted = converter.convert_entity(entity, ctx)?;
        harvest_relationships(dim, pos, &converted, ctx);
        out_entities.push(converted);
    }
    let entity_count = out_entities.len() as u64;
    record::set(&mut dest, "entities", Value::List(out_entities));

    Ok(Some(ConvertedChunk {
        record: dest,
        entities: entity_count,
        block_entities: block_entity_count,
        skipped,
    }))
}

fn convert_region(
    store: &dyn KvStore,
    converter: &dyn Converter,
    item: &WorkItem,
    out_path: &Path,
    ctx: &mut Context,
    abort: &AtomicBool,
) -> Result<RegionStageStats> {
    let mut region = RegionFile::new();
    let mut stats = RegionStageStats {
        regions: 1,
        ..RegionStageStats::default()
    };
    for &pos in &item.chunks {
        if abort.load(Ordering::Relaxed) {
            return Err(Status::cancelled());
        }
        let converted = convert_one_chunk(store, converter, item.dimension, pos, ctx)
            .push_ctx(|| format!("chunk ({}, {})", pos.x, pos.z))?;
        let Some(converted) = converted else {
            warn!("chunk ({}, {}) vanished from the source store", pos.x, pos.z);
            continue;
        };
        let (lx, lz) = pos.local();
        if !region.insert(lx, lz, &converted.record)? {
            return Err(Status::malformed(format!(
                "chunk ({}, {}) exceeds the region slot budget",
                pos.x, pos.z
            )));
        }
        stats.chunks += 1;
        stats.entities += converted.entities;
        stats.block_entities += converted.block_entities;
        stats.skipped_records += converted.skipped;
    }
    region.save(out_path)?;
    debug!(
        "wrote {} ({} chunks, {} entities)",
        out_path.display(),
        stats.chunks,
        stats.entities
    );
    Ok(stats)
}

/// Convert every region on the work list, one worker per region.
///
/// Workers race to pop items (largest first), convert into a private
/// child context and an exclusively-owned output file, then fold the
/// child back into `root` under its mutex. A single region failing is
/// fatal: the abort flag stops other workers from starting new regions
/// and the first error is returned with its causal chain.
pub fn run_region_stage(
    store: &dyn KvStore,
    converter: &dyn Converter,
    root: &Mutex<Context>,
    items: Vec<WorkItem>,
    out_root: &Path,
    pool: &rayon::ThreadPool,
    concurrency: usize,
    abort: &AtomicBool,
    progress: &dyn Progress,
) -> Result<RegionStageStats> {
    let total = items.len() as u64;
    let queue: Mutex<VecDeque<WorkItem>> = Mutex::new(items.into());
    let first_error: Mutex<Option<Status>> = Mutex::new(None);
    let done = AtomicU64::new(0);
    let chunks = AtomicU64::new(0);
    let entities = AtomicU64::new(0);
    let block_entities = AtomicU64::new(0);
    let skipped = AtomicU64::new(0);
    let regions = AtomicU64::new(0);

    pool.in_place_scope(|s| {
        for _ in 0..concurrency.max(1) {
            let queue = &queue;
            let first_error = &first_error;
            let done = &done;
            let chunks = &chunks;
            let entities = &entities;
            let block_entities = &block_entities;
            let skipped = &skipped;
            let regions = &regions;
            s.spawn(move |_| {
                loop {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(item) = queue.lock().unwrap().pop_front() else {
                        break;
                    };
                    let mut ctx = root.lock().unwrap().make();
                    let out_path = out_root
                        .join(item.dimension.dir_name())
                        .join(item.region.file_name());
                    match convert_region(store, converter, &item, &out_path, &mut ctx, abort)
                    {
                        Ok(stats) => {
                            ctx.merge_into(&mut root.lock().unwrap());
                            regions.fetch_add(1, Ordering::Relaxed);
                            chunks.fetch_add(stats.chunks, Ordering::Relaxed);
                            entities.fetch_add(stats.entities, Ordering::Relaxed);
                            block_entities.fetch_add(stats.block_entities, Ordering::Relaxed);
                            skipped.fetch_add(stats.skipped_records, Ordering::Relaxed);
                            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                            if !progress.report(n, total) {
                                abort.store(true, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            abort.store(true, Ordering::Relaxed);
                            let e = e.push(format!(
                                "converting region {} of {}",
                                item.region.file_name(),
                                item.dimension
                            ));
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    if abort.load(Ordering::Relaxed) {
        return Err(Status::cancelled().push("region conversion"));
    }
    let stats = RegionStageStats {
        regions: regions.into_inner(),
        chunks: chunks.into_inner(),
        entities: entities.into_inner(),
        block_entities: block_entities.into_inner(),
        skipped_records: skipped.into_inner(),
    };
    info!(
        "converted {} region(s), {} chunk(s), {} entity record(s)",
        stats.regions, stats.chunks, stats.entities
    );
    Ok(stats)
}
