//! Mosaic and stack engine contracts
//!
//! The co-addition itself lives outside this crate. The driver reaches it
//! through [`MosaicEngine`] and [`StackEngine`]; [`CommandEngine`] implements
//! both by running an external executable.

pub mod command;

pub use command::CommandEngine;

use crate::butler::DataButler;
use crate::error::Result;
use crate::instrument::Instrument;
use crate::stack::{MatchPsfKernel, Wcs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[async_trait]
pub trait MosaicEngine: Send + Sync {
    /// Visits whose every chip has complete calibration products.
    ///
    /// Intermediate products are written below `output_dir`.
    async fn filter_frames(
        &self,
        butler: &dyn DataButler,
        visits: &[i64],
        ccds: &[u32],
        output_dir: &Path,
    ) -> Result<Vec<i64>>;
}

#[async_trait]
pub trait StackEngine: Send + Sync {
    /// Lay out the tile grid for `request.files` and pick the reference WCS
    async fn stack_init(&self, butler: &dyn DataButler, request: &StackInitRequest)
        -> Result<StackInit>;

    /// PSF width of one file after warping; `None` if it cannot be measured
    async fn measure_warped_psf(
        &self,
        butler: &dyn DataButler,
        request: &MeasureRequest,
    ) -> Result<Option<f64>>;

    /// Co-add one tile; the result goes straight to storage
    async fn stack_execute(&self, butler: &dyn DataButler, request: &TileRequest) -> Result<()>;

    async fn stack_finalize(&self, butler: &dyn DataButler, request: &FinalizeRequest)
        -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterFramesRequest {
    pub visits: Vec<i64>,
    pub ccds: Vec<u32>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackInitRequest {
    pub files: Vec<PathBuf>,
    pub sub_img_size: u32,
    pub img_margin: u32,
    pub file_io: bool,
    pub write_pbs_script: bool,
    pub work_dir: PathBuf,
    pub skip_mosaic: bool,
    pub rerun: String,
    pub instrument: Instrument,
    pub program: String,
    pub filter: String,
    pub date_obs: Option<String>,
    pub dest_wcs: Option<PathBuf>,
}

/// Tile grid and inputs chosen by `stack_init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackInit {
    pub nx: u32,
    pub ny: u32,
    pub file_list: Vec<PathBuf>,
    pub wcs: Wcs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRequest {
    pub file: PathBuf,
    pub wcs: Option<Wcs>,
    pub file_io: bool,
    pub skip_mosaic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRequest {
    pub ix: u32,
    pub iy: u32,
    pub stack_id: i64,
    pub sub_img_size: u32,
    pub img_margin: u32,
    pub file_io: bool,
    pub work_dir: PathBuf,
    pub skip_mosaic: bool,
    pub filter: String,
    pub match_psf: Option<MatchPsfKernel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub stack_id: i64,
    pub sub_img_size: u32,
    pub img_margin: u32,
    pub file_io: bool,
    pub work_dir: PathBuf,
    pub filter: String,
}
