use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Convert a world save into region-file format")]
pub struct Cli {
    /// Source world directory (the one holding the key-value store).
    pub source: PathBuf,

    /// Destination directory; created if missing.
    pub output: PathBuf,

    /// Worker threads shared across all stages. Zero means one per CPU.
    #[arg(long, default_value_t = 0)]
    pub concurrency: usize,

    /// Region radius terraform passes hold exclusively around their cell.
    #[arg(long, default_value_t = 1)]
    pub lock_radius: i32,

    /// Converter dialect. "passthrough" copies records unchanged.
    #[arg(long, default_value = "passthrough")]
    pub dialect: String,

    /// TOML options file; command-line flags override its values.
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Print per-region progress.
    #[arg(long, short)]
    pub verbose: bool,
}
