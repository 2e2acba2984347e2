//! Region file codec and the per-region conversion stage.
#![forbid(unsafe_code)]

mod file;
mod queue;
mod window;

pub use file::{REGION_WIDTH, RegionFile, SECTOR_SIZE};
pub use queue::{RegionStageStats, run_region_stage};
pub use window::RegionWindow;
