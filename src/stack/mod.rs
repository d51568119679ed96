//! Stacking job: shared job state, workers and the phase driver

pub mod driver;
pub mod kernel;
pub mod phases;
pub mod workers;

#[cfg(test)]
mod driver_test;

pub use driver::{Collaborators, ProductionCollaborators, StackDriver, StackReport, StackRequest};
pub use kernel::{derive_kernel, KernelKind, MatchPsfKernel};
pub use phases::{PhaseMetrics, PhaseRecord, PhaseType};
pub use workers::{ExecuteWorker, MeasureWorker};

use crate::butler::DataId;
use crate::config::StackSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// Rank that plans the job and gathers results
pub const ROOT: usize = 0;

/// Position of one output tile in the stacking grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileIndex {
    pub ix: u32,
    pub iy: u32,
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ix, self.iy)
    }
}

/// Every tile of an `nx` by `ny` grid, x-major
pub fn tile_grid(nx: u32, ny: u32) -> Vec<TileIndex> {
    (0..nx)
        .flat_map(|ix| (0..ny).map(move |iy| TileIndex { ix, iy }))
        .collect()
}

/// Reference world-coordinate system; opaque to the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wcs(pub Value);

/// Job parameters fixed on the root before any worker runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub filter: String,
    pub stack_id: i64,
    pub program: String,
    pub date_obs: Option<String>,
    pub img_margin: u32,
    pub sub_img_size: u32,
    pub file_io: bool,
    pub write_pbs_script: bool,
    pub skip_mosaic: bool,
    pub work_dir_root: PathBuf,
}

impl JobConfig {
    pub fn new(
        program: &str,
        filter: &str,
        date_obs: Option<&str>,
        stack_id: i64,
        work_dir_root: PathBuf,
        settings: &StackSettings,
    ) -> Self {
        Self {
            filter: filter.to_string(),
            stack_id,
            program: program.to_string(),
            date_obs: date_obs.map(str::to_string),
            img_margin: settings.img_margin,
            sub_img_size: settings.sub_img_size,
            file_io: settings.file_io,
            write_pbs_script: false,
            skip_mosaic: false,
            work_dir_root,
        }
    }

    /// `{work_dir_root}/{program}/{filter}`
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir_root.join(&self.program).join(&self.filter)
    }

    /// Identifier the job configuration is persisted under
    pub fn data_id(&self) -> DataId {
        DataId::new()
            .with("stack", self.stack_id)
            .with("filter", self.filter.as_str())
    }
}

/// Work partition the root broadcasts after initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPack {
    pub indexes: Vec<TileIndex>,
    pub file_list: Vec<PathBuf>,
    pub wcs: Option<Wcs>,
}
