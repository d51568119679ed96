//! Per-rank workers for the scattered phases
//!
//! A worker is built once per rank with the job state it needs and is then
//! called for every item the root sends it. Each call resolves its own
//! butler: ranks share nothing but what crosses a collective.

use super::{Collaborators, JobConfig, MatchPsfKernel, TileIndex, Wcs};
use crate::comm::{node_id, ScatterWorker};
use crate::engine::{MeasureRequest, TileRequest};
use crate::error::Result;
use crate::instrument::Instrument;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Measures the warped PSF width of one input file per call
pub struct MeasureWorker {
    rerun: String,
    instrument: Instrument,
    config: JobConfig,
    wcs: Option<Wcs>,
    collaborators: Arc<dyn Collaborators>,
}

impl MeasureWorker {
    pub fn new(
        rerun: &str,
        instrument: Instrument,
        config: JobConfig,
        wcs: Option<Wcs>,
        collaborators: Arc<dyn Collaborators>,
    ) -> Self {
        Self {
            rerun: rerun.to_string(),
            instrument,
            config,
            wcs,
            collaborators,
        }
    }
}

#[async_trait]
impl ScatterWorker<PathBuf, f64> for MeasureWorker {
    async fn call(&mut self, file: PathBuf) -> Result<Option<f64>> {
        let butler = self.collaborators.butler(self.instrument, &self.rerun)?;
        info!(
            "Started measuring warped PSF for {} on {}",
            file.display(),
            node_id()
        );

        let request = MeasureRequest {
            file,
            wcs: self.wcs.clone(),
            file_io: true,
            skip_mosaic: self.config.skip_mosaic,
        };
        let sigma = self
            .collaborators
            .stack()
            .measure_warped_psf(butler.as_ref(), &request)
            .await?;

        if sigma.is_none() {
            warn!("No PSF width measured for {}", request.file.display());
        }
        Ok(sigma)
    }
}

/// Co-adds one tile per call
pub struct ExecuteWorker {
    rerun: String,
    instrument: Instrument,
    config: JobConfig,
    match_psf: Option<MatchPsfKernel>,
    collaborators: Arc<dyn Collaborators>,
}

impl ExecuteWorker {
    pub fn new(
        rerun: &str,
        instrument: Instrument,
        config: JobConfig,
        match_psf: Option<MatchPsfKernel>,
        collaborators: Arc<dyn Collaborators>,
    ) -> Self {
        Self {
            rerun: rerun.to_string(),
            instrument,
            config,
            match_psf,
            collaborators,
        }
    }
}

#[async_trait]
impl ScatterWorker<TileIndex, ()> for ExecuteWorker {
    async fn call(&mut self, tile: TileIndex) -> Result<Option<()>> {
        let butler = self.collaborators.butler(self.instrument, &self.rerun)?;
        info!("Started processing {} on {}", tile, node_id());

        let request = TileRequest {
            ix: tile.ix,
            iy: tile.iy,
            stack_id: self.config.stack_id,
            sub_img_size: self.config.sub_img_size,
            img_margin: self.config.img_margin,
            file_io: self.config.file_io,
            work_dir: self.config.work_dir(),
            skip_mosaic: self.config.skip_mosaic,
            filter: self.config.filter.clone(),
            match_psf: self.match_psf.clone(),
        };
        self.collaborators
            .stack()
            .stack_execute(butler.as_ref(), &request)
            .await?;
        Ok(Some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackSettings;
    use crate::stack::derive_kernel;
    use crate::testing::{RecordingEngine, TestCollaborators};

    fn config() -> JobConfig {
        JobConfig::new(
            "COSMOS_0",
            "W-S-I+",
            None,
            220,
            PathBuf::from("/work"),
            &StackSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_measure_worker_returns_engine_sigma() {
        let engine = RecordingEngine::new().with_sigma("/data/a.fits", 1.25);
        let collaborators = TestCollaborators::new(engine.clone());
        let mut worker = MeasureWorker::new(
            "cosmos",
            Instrument::Hsc,
            config(),
            None,
            Arc::new(collaborators.clone()),
        );

        assert_eq!(
            worker.call(PathBuf::from("/data/a.fits")).await.unwrap(),
            Some(1.25)
        );
        assert_eq!(worker.call(PathBuf::from("/data/b.fits")).await.unwrap(), None);
        assert_eq!(engine.measured().len(), 2);
        assert_eq!(collaborators.butlers_built(), 2);
    }

    #[tokio::test]
    async fn test_execute_worker_passes_tile_and_kernel() {
        let engine = RecordingEngine::new();
        let collaborators = TestCollaborators::new(engine.clone());
        let kernel = derive_kernel(&[1.5]);
        let mut worker = ExecuteWorker::new(
            "cosmos",
            Instrument::SuprimeCam,
            config(),
            kernel.clone(),
            Arc::new(collaborators),
        );

        let result = worker.call(TileIndex { ix: 1, iy: 2 }).await.unwrap();
        assert_eq!(result, Some(()));

        let executed = engine.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!((executed[0].ix, executed[0].iy), (1, 2));
        assert_eq!(executed[0].stack_id, 220);
        assert_eq!(executed[0].work_dir, PathBuf::from("/work/COSMOS_0/W-S-I+"));
        assert_eq!(executed[0].match_psf, kernel);
    }

    #[tokio::test]
    async fn test_engine_failure_propagates() {
        let engine = RecordingEngine::new().failing_tile(TileIndex { ix: 0, iy: 0 });
        let mut worker = ExecuteWorker::new(
            "cosmos",
            Instrument::Hsc,
            config(),
            None,
            Arc::new(TestCollaborators::new(engine)),
        );
        assert!(worker.call(TileIndex { ix: 0, iy: 0 }).await.is_err());
    }
}
