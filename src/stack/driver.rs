//! Phase driver for one stacking job
//!
//! Every rank calls [`StackDriver::run`] with its own [`Comm`]. The root
//! plans the job (discover, initialize), every rank meets it at the same
//! sequence of collectives, and the root closes out the stack:
//!
//! | step | root | workers |
//! |------|------|---------|
//! | plan | query, filter frames, resolve files, `stack_init` | wait |
//! | broadcast | job config, data pack | receive |
//! | persist | write `stack_config` | stub write |
//! | measure (optional) | gather sigmas | measure files |
//! | broadcast | kernel | receive |
//! | execute | dispatch tiles | stack tiles |
//! | finalize | `stack_finalize` | wait |
//! | broadcast | report | receive |
//!
//! The closing broadcast keeps every rank inside a collective until the
//! root is done, so an abort raised while finalizing reaches all of them.

use super::kernel::derive_kernel;
use super::phases::{PhaseRecord, PhaseTimer, PhaseType};
use super::workers::{ExecuteWorker, MeasureWorker};
use super::{tile_grid, DataPack, JobConfig, MatchPsfKernel, TileIndex, ROOT};
use crate::butler::{share_data_refs, DataButler, DataRef, MetadataQuery, CALEXP};
use crate::comm::Comm;
use crate::config::{Settings, StackSettings};
use crate::engine::{
    CommandEngine, FinalizeRequest, MosaicEngine, StackEngine, StackInitRequest,
};
use crate::error::{ErrorCode, Result, StackError};
use crate::instrument::Instrument;
use crate::subprocess::SubprocessManager;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Dataset the job configuration is persisted as
pub const STACK_CONFIG: &str = "stack_config";

/// Source of butlers and engines for every rank
pub trait Collaborators: Send + Sync {
    /// A fresh data butler for the instrument and rerun
    fn butler(&self, instrument: Instrument, rerun: &str) -> Result<Arc<dyn DataButler>>;

    fn mosaic(&self) -> Arc<dyn MosaicEngine>;

    fn stack(&self) -> Arc<dyn StackEngine>;
}

/// Filesystem butlers and the external stacking executable
pub struct ProductionCollaborators {
    settings: Settings,
    engine: Arc<CommandEngine>,
}

impl ProductionCollaborators {
    pub fn new(settings: Settings, subprocess: &SubprocessManager) -> Self {
        let engine = Arc::new(CommandEngine::new(subprocess.runner(), &settings.engine));
        Self { settings, engine }
    }
}

impl Collaborators for ProductionCollaborators {
    fn butler(&self, instrument: Instrument, rerun: &str) -> Result<Arc<dyn DataButler>> {
        Ok(Arc::new(instrument.mapper(rerun, &self.settings)?))
    }

    fn mosaic(&self) -> Arc<dyn MosaicEngine> {
        Arc::clone(&self.engine) as Arc<dyn MosaicEngine>
    }

    fn stack(&self) -> Arc<dyn StackEngine> {
        Arc::clone(&self.engine) as Arc<dyn StackEngine>
    }
}

/// What to stack, as given on the command line
#[derive(Debug, Clone, PartialEq)]
pub struct StackRequest {
    pub rerun: String,
    pub instrument: Instrument,
    pub program: String,
    pub filter: String,
    pub date_obs: Option<String>,
    pub work_dir_root: PathBuf,
    pub dest_wcs: Option<PathBuf>,
    pub do_match_psf: bool,
    pub stack: StackSettings,
}

/// Summary of a finished job, identical on every rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackReport {
    pub stack_id: i64,
    pub frames_found: usize,
    pub frames_kept: usize,
    pub files: usize,
    pub tiles: usize,
    pub tiles_stacked: usize,
    pub sigmas_measured: usize,
    pub kernel: Option<MatchPsfKernel>,
    pub phases: Vec<PhaseRecord>,
}

/// Root-only state built while planning
struct RootPlan {
    butler: Arc<dyn DataButler>,
    config: JobConfig,
    pack: DataPack,
    frames_found: usize,
    frames_kept: usize,
    phases: Vec<PhaseRecord>,
}

pub struct StackDriver {
    request: StackRequest,
    collaborators: Arc<dyn Collaborators>,
}

impl StackDriver {
    pub fn new(request: StackRequest, collaborators: Arc<dyn Collaborators>) -> Self {
        Self {
            request,
            collaborators,
        }
    }

    /// Run the job on this rank. Every rank of the world must call this.
    pub async fn run(&self, comm: &Comm) -> Result<StackReport> {
        let mut plan = if comm.is_root(ROOT) {
            Some(self.plan().await?)
        } else {
            None
        };

        let config = comm
            .broadcast(plan.as_ref().map(|p| p.config.clone()), ROOT)
            .await?;
        let pack = comm
            .broadcast(plan.as_ref().map(|p| p.pack.clone()), ROOT)
            .await?;
        debug!(
            "Rank {} holds {} files and {} tiles",
            comm.rank(),
            pack.file_list.len(),
            pack.indexes.len()
        );

        self.persist_config(comm, plan.as_ref(), &config).await?;

        let sigmas = if self.request.do_match_psf {
            self.measure(comm, &config, &pack, plan.as_mut()).await?
        } else {
            Vec::new()
        };

        let kernel = comm
            .broadcast(comm.is_root(ROOT).then(|| derive_kernel(&sigmas)), ROOT)
            .await?;
        if let Some(kernel) = &kernel {
            debug!(
                "Matching PSFs with a {}x{} kernel (sigma1 = {:.3})",
                kernel.width, kernel.height, kernel.sigma1
            );
        }

        let tiles_stacked = self
            .execute(comm, &config, &pack, kernel.clone(), plan.as_mut())
            .await?;

        let report = match plan {
            Some(plan) => Some(
                self.finalize(plan, tiles_stacked, sigmas.len(), kernel)
                    .await?,
            ),
            None => None,
        };
        comm.broadcast(report, ROOT).await
    }

    async fn plan(&self) -> Result<RootPlan> {
        let request = &self.request;
        let butler = self
            .collaborators
            .butler(request.instrument, &request.rerun)?;

        let query = MetadataQuery::new(
            &request.program,
            &request.filter,
            request.date_obs.as_deref(),
        );
        let visits = butler.query_metadata(CALEXP, "visit", &query).await?;
        let pointings = butler.query_metadata(CALEXP, "pointing", &query).await?;
        info!("Visits: {:?}", visits);
        info!("Pointings: {:?}", pointings);

        let stack_id = match pointings.first() {
            Some(&pointing) => pointing,
            None => {
                warn!(
                    "No pointing found for {} in {}; using stack id 0",
                    request.program, request.filter
                );
                0
            }
        };

        let config = JobConfig::new(
            &request.program,
            &request.filter,
            request.date_obs.as_deref(),
            stack_id,
            request.work_dir_root.clone(),
            &request.stack,
        );

        let mut phases = Vec::new();
        let ccds = request.instrument.ccd_ids();

        let timer = PhaseTimer::start(PhaseType::Discover);
        let kept = self.discover(butler.as_ref(), &visits, &ccds).await?;
        phases.push(timer.finish(visits.len(), kept.len()));

        let timer = PhaseTimer::start(PhaseType::Initialize);
        let files = resolve_files(butler.as_ref(), &kept, &ccds).await;
        create_work_dir(&config.work_dir()).await?;
        let pack = self.initialize(butler.as_ref(), &config, files.clone()).await?;
        phases.push(timer.finish(kept.len() * ccds.len(), files.len()));
        info!("nx x ny = {} tiles over {} files", pack.indexes.len(), pack.file_list.len());

        Ok(RootPlan {
            butler,
            config,
            pack,
            frames_found: visits.len(),
            frames_kept: kept.len(),
            phases,
        })
    }

    async fn discover(
        &self,
        butler: &dyn DataButler,
        visits: &[i64],
        ccds: &[u32],
    ) -> Result<Vec<i64>> {
        if visits.is_empty() {
            warn!("No frames match {} / {}", self.request.program, self.request.filter);
            return Ok(Vec::new());
        }

        let kept = self
            .collaborators
            .mosaic()
            .filter_frames(butler, visits, ccds, &self.request.work_dir_root)
            .await?;

        let known: HashSet<i64> = visits.iter().copied().collect();
        if let Some(stray) = kept.iter().find(|v| !known.contains(v)) {
            return Err(StackError::phase_with_code(
                ErrorCode::PHASE_DISCOVER_FAILED,
                format!("mosaic kept visit {} which was never queried", stray),
                PhaseType::Discover,
            ));
        }
        info!("{} of {} frames have complete calibration", kept.len(), visits.len());
        Ok(kept)
    }

    async fn initialize(
        &self,
        butler: &dyn DataButler,
        config: &JobConfig,
        files: Vec<PathBuf>,
    ) -> Result<DataPack> {
        if files.is_empty() {
            warn!("No input files; nothing to stack");
            return Ok(DataPack::default());
        }

        let request = StackInitRequest {
            files,
            sub_img_size: config.sub_img_size,
            img_margin: config.img_margin,
            file_io: config.file_io,
            write_pbs_script: config.write_pbs_script,
            work_dir: config.work_dir(),
            skip_mosaic: config.skip_mosaic,
            rerun: self.request.rerun.clone(),
            instrument: self.request.instrument,
            program: config.program.clone(),
            filter: config.filter.clone(),
            date_obs: config.date_obs.clone(),
            dest_wcs: self.request.dest_wcs.as_deref().map(absolute).transpose()?,
        };
        let init = self
            .collaborators
            .stack()
            .stack_init(butler, &request)
            .await?;

        Ok(DataPack {
            indexes: tile_grid(init.nx, init.ny),
            file_list: init.file_list,
            wcs: Some(init.wcs),
        })
    }

    async fn persist_config(
        &self,
        comm: &Comm,
        plan: Option<&RootPlan>,
        config: &JobConfig,
    ) -> Result<()> {
        let refs = share_data_refs(
            comm,
            ROOT,
            plan.map(|p| Arc::clone(&p.butler)),
            plan.map(|p| vec![p.config.data_id()]),
        )
        .await?;

        let value = serde_json::to_value(config)?;
        for data_ref in &refs {
            data_ref.put(STACK_CONFIG, &value).await?;
        }
        Ok(())
    }

    async fn measure(
        &self,
        comm: &Comm,
        config: &JobConfig,
        pack: &DataPack,
        plan: Option<&mut RootPlan>,
    ) -> Result<Vec<f64>> {
        let timer = comm
            .is_root(ROOT)
            .then(|| PhaseTimer::start(PhaseType::Measure));

        let mut worker = runs_items(comm).then(|| {
            MeasureWorker::new(
                &self.request.rerun,
                self.request.instrument,
                config.clone(),
                pack.wcs.clone(),
                Arc::clone(&self.collaborators),
            )
        });
        let items = if comm.is_root(ROOT) {
            pack.file_list.clone()
        } else {
            Vec::new()
        };

        let gathered = comm
            .scatter_job::<PathBuf, f64, MeasureWorker>(worker.as_mut(), items, ROOT)
            .await?;
        let sigmas: Vec<f64> = gathered.iter().flatten().copied().collect();

        if let (Some(timer), Some(plan)) = (timer, plan) {
            plan.phases.push(timer.finish(gathered.len(), sigmas.len()));
        }
        Ok(sigmas)
    }

    async fn execute(
        &self,
        comm: &Comm,
        config: &JobConfig,
        pack: &DataPack,
        kernel: Option<MatchPsfKernel>,
        plan: Option<&mut RootPlan>,
    ) -> Result<usize> {
        let timer = comm
            .is_root(ROOT)
            .then(|| PhaseTimer::start(PhaseType::Execute));

        let mut worker = runs_items(comm).then(|| {
            ExecuteWorker::new(
                &self.request.rerun,
                self.request.instrument,
                config.clone(),
                kernel,
                Arc::clone(&self.collaborators),
            )
        });
        let items: Vec<TileIndex> = if comm.is_root(ROOT) {
            pack.indexes.clone()
        } else {
            Vec::new()
        };

        let gathered = comm
            .scatter_job::<TileIndex, (), ExecuteWorker>(worker.as_mut(), items, ROOT)
            .await?;
        let stacked = gathered.iter().flatten().count();

        if comm.is_root(ROOT) && stacked < gathered.len() {
            return Err(StackError::phase_with_code(
                ErrorCode::PHASE_EXECUTE_FAILED,
                format!("{} of {} tiles were not stacked", gathered.len() - stacked, gathered.len()),
                PhaseType::Execute,
            ));
        }

        if let (Some(timer), Some(plan)) = (timer, plan) {
            plan.phases.push(timer.finish(gathered.len(), stacked));
        }
        Ok(stacked)
    }

    async fn finalize(
        &self,
        mut plan: RootPlan,
        tiles_stacked: usize,
        sigmas_measured: usize,
        kernel: Option<MatchPsfKernel>,
    ) -> Result<StackReport> {
        let config = &plan.config;

        if plan.pack.indexes.is_empty() {
            info!("No tiles stacked; skipping finalize");
        } else {
            let timer = PhaseTimer::start(PhaseType::Finalize);
            let request = FinalizeRequest {
                stack_id: config.stack_id,
                sub_img_size: config.sub_img_size,
                img_margin: config.img_margin,
                file_io: config.file_io,
                work_dir: config.work_dir(),
                filter: config.filter.clone(),
            };
            self.collaborators
                .stack()
                .stack_finalize(plan.butler.as_ref(), &request)
                .await?;
            plan.phases.push(timer.finish(1, 1));
        }

        let report = StackReport {
            stack_id: config.stack_id,
            frames_found: plan.frames_found,
            frames_kept: plan.frames_kept,
            files: plan.pack.file_list.len(),
            tiles: plan.pack.indexes.len(),
            tiles_stacked,
            sigmas_measured,
            kernel,
            phases: plan.phases,
        };
        info!(
            "Stack {} done: {} tiles from {} files ({} of {} frames kept)",
            report.stack_id, report.tiles_stacked, report.files, report.frames_kept, report.frames_found
        );
        Ok(report)
    }
}

/// Whether this rank applies a worker to scattered items
fn runs_items(comm: &Comm) -> bool {
    !comm.is_root(ROOT) || comm.size() == 1
}

/// Calexp files of the kept frames that exist on disk.
///
/// Unresolvable or missing files are logged and skipped.
async fn resolve_files(butler: &dyn DataButler, visits: &[i64], ccds: &[u32]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for &visit in visits {
        for &ccd in ccds {
            let path = match butler.calexp_filename(visit, ccd).await {
                Ok(path) => path,
                Err(e) => {
                    warn!("Failed to get file for {}:{}: {}", visit, ccd, e);
                    continue;
                }
            };
            if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                files.push(path);
            } else {
                warn!("File {} does not exist", path.display());
            }
        }
    }
    files
}

async fn create_work_dir(dir: &Path) -> Result<()> {
    if fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
        info!("Working directory {} already exists", dir.display());
        return Ok(());
    }
    fs::create_dir_all(dir).await.map_err(|e| {
        StackError::phase_with_code(
            ErrorCode::PHASE_INITIALIZE_FAILED,
            format!("cannot create working directory {}", dir.display()),
            PhaseType::Initialize,
        )
        .with_source(e)
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_work_dir_tolerates_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let work = dir.path().join("COSMOS_0").join("W-S-I+");
        create_work_dir(&work).await.unwrap();
        assert!(work.is_dir());
        create_work_dir(&work).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_work_dir_fails_on_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("COSMOS_0");
        std::fs::write(&blocker, "not a directory").unwrap();
        let err = create_work_dir(&blocker.join("W-S-I+")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PHASE_INITIALIZE_FAILED);
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        assert_eq!(
            absolute(Path::new("/wcs/dest.fits")).unwrap(),
            PathBuf::from("/wcs/dest.fits")
        );
        let resolved = absolute(Path::new("dest.fits")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("dest.fits"));
    }
}
