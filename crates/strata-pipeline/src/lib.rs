//! End-to-end world conversion: scan, convert, terraform, finalize.
#![forbid(unsafe_code)]

mod options;
mod stitch;
#[cfg(test)]
mod tests;

pub use options::{Dialect, PipelineOptions};
pub use stitch::{StitchStats, extract_root_vehicle, stitch_relationships};

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use fastnbt::Value;
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{info, warn};
use strata_core::{BlockPos, ChunkPos, Dimension, Progress, Result, Status, StatusExt};
use strata_ctx::{
    Accum, ChunksInRegion, Context, Converter, MapAsset, PassthroughConverter, Record,
    StructureBounds, harvest_relationships, record,
};
use strata_region::{RegionStageStats, run_region_stage};
use strata_scan::scan;
use strata_store::{KvStore, RecordTag, SourceKey, TableStore};
use strata_terraform::{RelightPass, run_terraform_stage};
use strata_vfs::Sandbox;

/// Counters reported back to the caller after a successful run.
#[derive(Clone, Copy, Debug, Default)]
pub struct Summary {
    pub records_seen: u64,
    pub chunk_records: u64,
    pub regions_written: u64,
    pub chunks_written: u64,
    pub entities: u64,
    pub block_entities: u64,
    pub maps: u64,
    pub lodestones: u64,
    pub leashes_stitched: u64,
    pub vehicles_stitched: u64,
    pub unresolved_links: u64,
    pub skipped_records: u64,
}

pub struct ConversionPipeline {
    source: PathBuf,
    output: PathBuf,
    options: PipelineOptions,
}

fn decode(value: &[u8]) -> Result<Record> {
    fastnbt::from_bytes(value).map_err(|e| Status::malformed(e.to_string()))
}

fn map_asset(rec: &Record) -> Option<MapAsset> {
    let dimension = Dimension::from_id(record::get_i32(rec, "dimension")?)?;
    let pixels = match record::get(rec, "colors") {
        Some(Value::ByteArray(arr)) => arr.iter().map(|b| *b as u8).collect(),
        _ => return None,
    };
    Some(MapAsset {
        scale: record::get_i32(rec, "scale")? as u8,
        dimension,
        center_x: record::get_i32(rec, "xCenter")?,
        center_z: record::get_i32(rec, "zCenter")?,
        pixels,
    })
}

fn structure_bounds(owner: ChunkPos, rec: &Record) -> Option<StructureBounds> {
    let kind = record::get_str(rec, "structureName")?.to_string();
    let base = record::block_pos(rec)?;
    let min = BlockPos {
        x: base.x + record::get_i32(rec, "xStructureOffset").unwrap_or(0),
        y: base.y + record::get_i32(rec, "yStructureOffset").unwrap_or(0),
        z: base.z + record::get_i32(rec, "zStructureOffset").unwrap_or(0),
    };
    let max = BlockPos {
        x: min.x + record::get_i32(rec, "xStructureSize")?.max(1) - 1,
        y: min.y + record::get_i32(rec, "yStructureSize")?.max(1) - 1,
        z: min.z + record::get_i32(rec, "zStructureSize")?.max(1) - 1,
    };
    Some(StructureBounds {
        kind,
        min,
        max,
        owner,
    })
}

/// Scan-stage record classifier. Cheap per record: only block-entity and
/// map payloads are decoded, everything else is keyed work.
fn accept_record(key: &[u8], value: &[u8], accum: &mut Accum) {
    accum.records_seen += 1;
    match SourceKey::classify(key) {
        SourceKey::Chunk(ck) => {
            accum.chunk_records += 1;
            accum.chunks.insert(ck.dimension, ck.pos);
            if ck.tag != RecordTag::BlockEntities {
                return;
            }
            let Ok(rec) = decode(value) else {
                accum.skipped_malformed += 1;
                return;
            };
            let Some(Value::List(entries)) = record::get(&rec, "list") else {
                return;
            };
            for entry in entries {
                match record::get_str(entry, "id") {
                    Some("minecraft:lodestone") => {
                        if let Some(pos) = record::block_pos(entry) {
                            accum.lodestone_candidates.insert((ck.dimension, pos));
                        }
                    }
                    Some("minecraft:structure_block") => {
                        if let Some(bounds) = structure_bounds(ck.pos, entry) {
                            accum.add_structure(ck.dimension, bounds);
                        }
                    }
                    _ => {}
                }
            }
        }
        SourceKey::Map(id) => match decode(value).ok().as_ref().and_then(map_asset) {
            Some(asset) => {
                accum.maps.entry(id).or_insert(asset);
            }
            None => accum.skipped_malformed += 1,
        },
        // The player record is converted during finalize; globals pass
        // through untouched.
        SourceKey::LocalPlayer | SourceKey::Global(_) | SourceKey::Other => {}
    }
}

fn write_gzipped(path: &Path, rec: &Record) -> Result<()> {
    let bytes =
        fastnbt::to_bytes(rec).map_err(|e| Status::malformed(e.to_string()))?;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&bytes)
        .push_ctx(|| format!("compressing {}", path.display()))?;
    let compressed = enc
        .finish()
        .push_ctx(|| format!("compressing {}", path.display()))?;
    std::fs::write(path, compressed).push_ctx(|| format!("writing {}", path.display()))
}

fn uuid_int_array(id: u128) -> Value {
    Value::IntArray(fastnbt::IntArray::new(
        record::uuid_to_int_array(id).to_vec(),
    ))
}

impl ConversionPipeline {
    pub fn new(source: PathBuf, output: PathBuf, options: PipelineOptions) -> Self {
        Self {
            source,
            output,
            options,
        }
    }

    fn converter(&self) -> Box<dyn Converter> {
        match self.options.dialect {
            Dialect::Passthrough => Box::new(PassthroughConverter),
        }
    }

    fn temp_root(&self) -> PathBuf {
        if self.options.temp_root.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.options.temp_root)
        }
    }

    /// Run the full conversion. Stages are strict barriers: scan, then
    /// region conversion, then terraform, then finalize. The sandbox's
    /// staging directory is removed when this returns, successful or not.
    pub fn run(&self, progress: &dyn Progress) -> Result<Summary> {
        let concurrency = self.options.effective_concurrency();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|i| format!("strata-{i}"))
            .build()
            .map_err(|e| Status::io(e.to_string()).push("building worker pool"))?;
        let abort = AtomicBool::new(false);
        let converter = self.converter();

        let sandbox = Sandbox::open(&self.source, &self.temp_root())?;
        let db_root = {
            let nested = sandbox.store_root().join("db");
            if nested.join("MANIFEST").exists() {
                nested
            } else {
                sandbox.store_root().to_path_buf()
            }
        };
        let store = TableStore::open(&sandbox, &db_root)
            .push_ctx(|| format!("opening source store {}", self.source.display()))?;
        info!(
            "opened {} ({} records), {} worker(s)",
            self.source.display(),
            store.len(),
            concurrency
        );

        let accum = scan(
            &store,
            &pool,
            concurrency,
            Accum::default,
            accept_record,
            Accum::merge,
            &abort,
        )
        .into_result()?;

        let mut summary = Summary {
            records_seen: accum.records_seen,
            chunk_records: accum.chunk_records,
            skipped_records: accum.skipped_malformed,
            ..Summary::default()
        };
        let (manifest, items) = accum.into_manifest();
        summary.maps = manifest.maps.len() as u64;
        summary.lodestones = manifest.lodestones.len() as u64;
        let chunks: ChunksInRegion = manifest.chunks.clone();
        info!(
            "scan found {} chunk(s) across {} region(s), {} map(s), {} lodestone(s)",
            chunks.total_chunks(),
            chunks.region_count(),
            summary.maps,
            summary.lodestones
        );

        self.prepare_output(&chunks)?;

        let root = Mutex::new(Context::new(manifest));
        let stats = run_region_stage(
            &store,
            converter.as_ref(),
            &root,
            items,
            &self.output,
            &pool,
            concurrency,
            &abort,
            progress,
        )?;
        self.fold_region_stats(&mut summary, stats);

        run_terraform_stage(
            &chunks,
            &self.output,
            &RelightPass,
            self.options.lock_radius,
            &pool,
            concurrency,
            &abort,
            progress,
        )?;

        let ctx = root
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.finalize(&store, converter.as_ref(), ctx, &mut summary)?;
        Ok(summary)
    }

    /// Create the per-dimension and asset directories. On failure the
    /// directories this call created are removed again (only if still
    /// empty, so a pre-existing output tree is never touched).
    fn prepare_output(&self, chunks: &ChunksInRegion) -> Result<()> {
        let mut dirs: Vec<PathBuf> = chunks
            .dimensions()
            .into_iter()
            .map(|dim| self.output.join(dim.dir_name()))
            .collect();
        dirs.push(self.output.join("data"));

        let mut created = Vec::new();
        for dir in dirs {
            if !dir.exists() {
                created.push(dir.clone());
            }
            if let Err(e) = std::fs::create_dir_all(&dir) {
                for dir in created.iter().rev() {
                    let _ = std::fs::remove_dir(dir);
                }
                return Err(Status::from(e).push(format!("creating {}", dir.display())));
            }
        }
        Ok(())
    }

    fn fold_region_stats(&self, summary: &mut Summary, stats: RegionStageStats) {
        summary.regions_written = stats.regions;
        summary.chunks_written = stats.chunks;
        summary.entities = stats.entities;
        summary.block_entities = stats.block_entities;
        summary.skipped_records += stats.skipped_records;
    }

    /// Write maps, the lodestone index and the top-level metadata, then
    /// stitch cross-region relationships into the finished region files.
    fn finalize(
        &self,
        store: &dyn KvStore,
        converter: &dyn Converter,
        mut ctx: Context,
        summary: &mut Summary,
    ) -> Result<()> {
        for (&id, asset) in &ctx.manifest().maps {
            let path = self.output.join("data").join(format!("map_{id}.dat"));
            write_gzipped(&path, &map_record(asset))
                .push_ctx(|| format!("writing map {id}"))?;
        }
        if !ctx.manifest().lodestones.is_empty() {
            let path = self.output.join("data").join("lodestones.dat");
            write_gzipped(&path, &lodestone_index(&ctx))?;
        }

        let stitched = stitch_relationships(&ctx, &self.output)?;
        summary.leashes_stitched = stitched.leashes;
        summary.vehicles_stitched = stitched.vehicles;
        summary.unresolved_links = stitched.unresolved;

        let player = match store.get(b"~local_player")? {
            Some(raw) => {
                let rec = decode(&raw).push_ctx(|| "decoding the player record".to_string())?;
                let mut fctx = ctx.make();
                let mut rec = converter
                    .convert_entity(rec, &mut fctx)
                    .push_ctx(|| "converting the player record".to_string())?;
                // The player's own record carries shoulder payloads and
                // the root-vehicle attachment; harvest it like any other
                // entity so first-wins merging applies.
                harvest_relationships(Dimension::Overworld, player_chunk(&rec), &rec, &mut fctx);
                fctx.merge_into(&mut ctx);
                record::remove(&mut rec, "RootVehicle");
                if let Some(shoulder) = &ctx.shoulder_left {
                    record::set(&mut rec, "ShoulderEntityLeft", shoulder.clone());
                }
                if let Some(shoulder) = &ctx.shoulder_right {
                    record::set(&mut rec, "ShoulderEntityRight", shoulder.clone());
                }
                if let Some(vehicle) = extract_root_vehicle(&ctx, &self.output)? {
                    let attach = ctx
                        .root_vehicle
                        .as_ref()
                        .map(|rv| rv.vehicle)
                        .unwrap_or_default();
                    record::set(
                        &mut rec,
                        "RootVehicle",
                        record::compound(vec![
                            ("Attach", uuid_int_array(attach)),
                            ("Entity", vehicle),
                        ]),
                    );
                }
                Some(rec)
            }
            None => {
                warn!("source has no player record");
                None
            }
        };

        let mut features = vec![Value::String("minecraft:vanilla".to_string())];
        if ctx.flags.bundles {
            features.push(Value::String("minecraft:bundle".to_string()));
        }
        let mut data = vec![
            ("enabled_features", Value::List(features)),
            ("WasConverted", Value::Byte(1)),
            (
                "lodestone_count",
                Value::Int(ctx.manifest().lodestones.len() as i32),
            ),
        ];
        if let Some(player) = player {
            data.push(("Player", player));
        }
        let level = record::compound(vec![("Data", record::compound(data))]);
        write_gzipped(&self.output.join("level.dat"), &level)?;
        info!(
            "finalized {}: {} leash(es) and {} vehicle link(s) stitched, {} unresolved",
            self.output.display(),
            summary.leashes_stitched,
            summary.vehicles_stitched,
            summary.unresolved_links
        );
        Ok(())
    }
}

fn player_chunk(rec: &Record) -> ChunkPos {
    if let Some(Value::List(pos)) = record::get(rec, "Pos") {
        if let (Some(Value::Double(x)), Some(Value::Double(z))) = (pos.first(), pos.get(2)) {
            return BlockPos {
                x: x.floor() as i32,
                y: 0,
                z: z.floor() as i32,
            }
            .chunk();
        }
    }
    ChunkPos::new(0, 0)
}

fn map_record(asset: &MapAsset) -> Record {
    let colors: Vec<i8> = asset.pixels.iter().map(|b| *b as i8).collect();
    record::compound(vec![(
        "data",
        record::compound(vec![
            ("scale", Value::Byte(asset.scale as i8)),
            ("dimension", Value::Byte(asset.dimension.id() as i8)),
            ("xCenter", Value::Int(asset.center_x)),
            ("zCenter", Value::Int(asset.center_z)),
            ("locked", Value::Byte(1)),
            ("colors", Value::ByteArray(fastnbt::ByteArray::new(colors))),
        ]),
    )])
}

fn lodestone_index(ctx: &Context) -> Record {
    let lodestones = &ctx.manifest().lodestones;
    let mut entries = Vec::new();
    for handle in 1..=lodestones.len() as i32 {
        if let Some((dim, pos)) = lodestones.resolve(handle) {
            entries.push(record::compound(vec![
                ("handle", Value::Int(handle)),
                ("dimension", Value::Int(dim.id())),
                ("X", Value::Int(pos.x)),
                ("Y", Value::Int(pos.y)),
                ("Z", Value::Int(pos.z)),
            ]));
        }
    }
    record::compound(vec![("lodestones", Value::List(entries))])
}
