use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use log::{error, info};
use strata_core::Progress;
use strata_pipeline::{ConversionPipeline, Dialect, PipelineOptions};

mod cli;

struct ConsoleProgress {
    verbose: bool,
    last: AtomicU64,
}

impl Progress for ConsoleProgress {
    fn report(&self, done: u64, total: u64) -> bool {
        if self.verbose && self.last.swap(done, Ordering::Relaxed) != done {
            info!("{done}/{total} regions");
        }
        true
    }
}

fn parse_dialect(name: &str) -> Result<Dialect, String> {
    match name {
        "passthrough" => Ok(Dialect::Passthrough),
        other => Err(format!("unknown dialect {other:?}")),
    }
}

fn run() -> Result<strata_pipeline::Summary, String> {
    let args = cli::Cli::parse();

    let mut options = match &args.options {
        Some(path) => PipelineOptions::load(path).map_err(|e| e.to_string())?,
        None => PipelineOptions::default(),
    };
    if args.concurrency != 0 {
        options.concurrency = args.concurrency;
    }
    options.lock_radius = args.lock_radius;
    options.dialect = parse_dialect(&args.dialect)?;

    let progress = ConsoleProgress {
        verbose: args.verbose,
        last: AtomicU64::new(0),
    };
    ConversionPipeline::new(args.source, args.output, options)
        .run(&progress)
        .map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(summary) => {
            info!(
                "converted {} chunk(s) in {} region(s); {} map(s), {} lodestone(s), \
                 {} relationship(s) stitched, {} skipped",
                summary.chunks_written,
                summary.regions_written,
                summary.maps,
                summary.lodestones,
                summary.leashes_stitched + summary.vehicles_stitched,
                summary.skipped_records
            );
            ExitCode::SUCCESS
        }
        Err(msg) => {
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}
