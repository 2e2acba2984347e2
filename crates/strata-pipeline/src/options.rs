use std::path::Path;

use serde::Deserialize;
use strata_core::{Result, Status, StatusExt};

/// Which converter dialect drives block/item/entity translation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Identity translation plus registry bookkeeping.
    #[default]
    Passthrough,
}

/// Tunables for one conversion run, loadable from a TOML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineOptions {
    /// Worker threads shared across all stages. Zero means one per
    /// available CPU.
    pub concurrency: usize,
    /// Chebyshev region radius terraform passes may touch around the
    /// region they hold.
    pub lock_radius: i32,
    pub dialect: Dialect,
    /// Where sandbox scratch directories are created. Empty means the
    /// system temp directory.
    pub temp_root: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 0,
            lock_radius: 1,
            dialect: Dialect::default(),
            temp_root: String::new(),
        }
    }
}

impl PipelineOptions {
    pub fn load(path: &Path) -> Result<PipelineOptions> {
        let text = std::fs::read_to_string(path)
            .push_ctx(|| format!("reading options file {}", path.display()))?;
        toml::from_str(&text).map_err(|e| {
            Status::malformed(e.to_string())
                .push(format!("parsing options file {}", path.display()))
        })
    }

    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            std::thread::available_parallelism().map_or(1, usize::from)
        } else {
            self.concurrency
        }
    }
}
