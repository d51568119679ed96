//! Whole-job runs of the driver over the in-process cluster

use super::driver::STACK_CONFIG;
use super::*;
use crate::butler::DataId;
use crate::comm::{abort_on_error, LocalCluster};
use crate::error::Result;
use crate::instrument::Instrument;
use crate::testing::{calexp_entries, InMemoryButler, RecordingEngine, TestCollaborators};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const PROGRAM: &str = "COSMOS_0";
const FILTER: &str = "W-S-I+";
const POINTING: i64 = 220;

struct Fixture {
    dir: TempDir,
    collaborators: TestCollaborators,
    engine: RecordingEngine,
    request: StackRequest,
}

impl Fixture {
    /// Suprime-Cam job over `visits`, with calexps on disk for `on_disk` only
    fn new(engine: RecordingEngine, visits: &[i64], on_disk: &[i64], do_match_psf: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let ccds = Instrument::SuprimeCam.ccd_ids();
        let missing: Vec<i64> = visits
            .iter()
            .copied()
            .filter(|v| !on_disk.contains(v))
            .collect();

        let butler = InMemoryButler::new(Instrument::SuprimeCam, dir.path().join("rerun/cosmos"))
            .with_entries(calexp_entries(PROGRAM, FILTER, POINTING, on_disk, &ccds));
        butler.touch_calexps().unwrap();
        let butler = butler.with_entries(calexp_entries(PROGRAM, FILTER, POINTING, &missing, &ccds));

        let request = StackRequest {
            rerun: "cosmos".to_string(),
            instrument: Instrument::SuprimeCam,
            program: PROGRAM.to_string(),
            filter: FILTER.to_string(),
            date_obs: None,
            work_dir_root: dir.path().join("work"),
            dest_wcs: None,
            do_match_psf,
            stack: Default::default(),
        };

        Self {
            collaborators: TestCollaborators::with_butler(butler, engine.clone()),
            engine,
            request,
            dir,
        }
    }

    fn calexp(&self, visit: i64, ccd: u32) -> PathBuf {
        self.dir
            .path()
            .join("rerun/cosmos")
            .join(Instrument::SuprimeCam.calexp_path(POINTING, FILTER, visit, ccd))
    }

    fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work").join(PROGRAM).join(FILTER)
    }

    async fn run(&self, ranks: usize) -> Vec<Result<StackReport>> {
        let driver = Arc::new(StackDriver::new(
            self.request.clone(),
            Arc::new(self.collaborators.clone()),
        ));
        LocalCluster::new(ranks)
            .unwrap()
            .run(move |comm| {
                let driver = Arc::clone(&driver);
                async move { abort_on_error(&comm, "process_mosaic_stack", driver.run(&comm)).await }
            })
            .await
    }
}

fn reports(outcomes: Vec<Result<StackReport>>) -> Vec<StackReport> {
    outcomes
        .into_iter()
        .enumerate()
        .map(|(rank, outcome)| {
            outcome.unwrap_or_else(|e| panic!("rank {} failed: {}", rank, e))
        })
        .collect()
}

#[tokio::test]
async fn test_full_pipeline_with_psf_matching() {
    let engine = RecordingEngine::new().with_grid(2, 3).keeping_visits(&[1234, 1236]);
    let fx = Fixture::new(engine, &[1234, 1236, 1240], &[1234, 1236, 1240], true);
    fx.engine.set_sigma(fx.calexp(1234, 0), 1.0);
    fx.engine.set_sigma(fx.calexp(1236, 3), 2.0);
    fx.engine.set_sigma(fx.calexp(1236, 9), 0.5);

    let reports = reports(fx.run(4).await);
    let report = &reports[0];
    assert!(reports.iter().all(|r| r == report));

    assert_eq!(report.stack_id, POINTING);
    assert_eq!(report.frames_found, 3);
    assert_eq!(report.frames_kept, 2);
    assert_eq!(report.files, 20);
    assert_eq!(report.tiles, 6);
    assert_eq!(report.tiles_stacked, 6);
    assert_eq!(report.sigmas_measured, 3);

    let kernel = report.kernel.clone().unwrap();
    assert_eq!(kernel.sigma1, 2.0);
    assert_eq!(kernel.sigma2, 4.0);
    assert_eq!(kernel.width, 17);

    let filtered = fx.engine.filtered();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].visits, vec![1234, 1236, 1240]);
    assert_eq!(filtered[0].ccds, (0..10).collect::<Vec<_>>());

    assert_eq!(fx.engine.inits().len(), 1);
    assert_eq!(fx.engine.measured().len(), 20);

    let executed = fx.engine.executed();
    assert_eq!(executed.len(), 6);
    assert!(executed.iter().all(|t| t.match_psf.as_ref() == Some(&kernel)));
    let mut tiles: Vec<(u32, u32)> = executed.iter().map(|t| (t.ix, t.iy)).collect();
    tiles.sort_unstable();
    assert_eq!(tiles, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);

    assert_eq!(fx.engine.finalized().len(), 1);
    assert!(fx.work_dir().is_dir());

    let phases: Vec<PhaseType> = report.phases.iter().map(|p| p.phase).collect();
    assert_eq!(
        phases,
        vec![
            PhaseType::Discover,
            PhaseType::Initialize,
            PhaseType::Measure,
            PhaseType::Execute,
            PhaseType::Finalize
        ]
    );
}

#[tokio::test]
async fn test_without_psf_matching_no_kernel_and_no_measurement() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], false);

    let reports = reports(fx.run(3).await);
    assert!(reports.iter().all(|r| r.kernel.is_none()));
    assert_eq!(reports[0].sigmas_measured, 0);

    assert!(fx.engine.measured().is_empty());
    let executed = fx.engine.executed();
    assert_eq!(executed.len(), 4);
    assert!(executed.iter().all(|t| t.match_psf.is_none()));
    assert!(!reports[0].phases.iter().any(|p| p.phase == PhaseType::Measure));
}

#[tokio::test]
async fn test_psf_matching_without_any_sigma_gives_no_kernel() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], true);

    let reports = reports(fx.run(2).await);
    assert_eq!(fx.engine.measured().len(), 10);
    assert_eq!(reports[0].sigmas_measured, 0);
    assert!(reports[0].kernel.is_none());
    assert!(fx.engine.executed().iter().all(|t| t.match_psf.is_none()));
}

#[tokio::test]
async fn test_no_frames_is_an_empty_job() {
    let fx = Fixture::new(RecordingEngine::new(), &[], &[], true);

    let reports = reports(fx.run(3).await);
    let report = &reports[0];
    assert_eq!(report.stack_id, 0);
    assert_eq!(report.frames_found, 0);
    assert_eq!(report.files, 0);
    assert_eq!(report.tiles, 0);
    assert_eq!(report.tiles_stacked, 0);

    assert!(fx.engine.filtered().is_empty());
    assert!(fx.engine.inits().is_empty());
    assert!(fx.engine.measured().is_empty());
    assert!(fx.engine.executed().is_empty());
    assert!(fx.engine.finalized().is_empty());
}

#[tokio::test]
async fn test_missing_calexps_are_skipped() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234, 1236, 1240], &[1234, 1240], false);

    let reports = reports(fx.run(2).await);
    assert_eq!(reports[0].frames_kept, 3);
    assert_eq!(reports[0].files, 20);

    let inits = fx.engine.inits();
    assert_eq!(inits.len(), 1);
    assert_eq!(inits[0].files.len(), 20);
    assert!(inits[0].files.iter().all(|f| Path::new(f).exists()));
    assert!(!inits[0].files.contains(&fx.calexp(1236, 0)));
}

#[tokio::test]
async fn test_existing_work_dir_is_fine() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], false);
    std::fs::create_dir_all(fx.work_dir()).unwrap();

    let reports = reports(fx.run(2).await);
    assert_eq!(reports[0].tiles_stacked, 4);
}

#[tokio::test]
async fn test_job_config_is_persisted_by_the_root() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], false);
    reports(fx.run(3).await);

    let id = DataId::new().with("stack", POINTING).with("filter", FILTER);
    let stored = fx
        .collaborators
        .butler_handle()
        .stored(STACK_CONFIG, &id)
        .unwrap();
    let config: JobConfig = serde_json::from_value(stored).unwrap();
    assert_eq!(config.program, PROGRAM);
    assert_eq!(config.stack_id, POINTING);
    assert_eq!(config.img_margin, 256);
}

#[tokio::test]
async fn test_single_rank_does_all_the_work() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], false);

    let reports = reports(fx.run(1).await);
    assert_eq!(reports[0].tiles_stacked, 4);
    assert_eq!(fx.engine.executed().len(), 4);
    assert_eq!(fx.engine.finalized().len(), 1);
}

#[tokio::test]
async fn test_workers_build_their_own_butlers() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], false);
    reports(fx.run(3).await);

    // One for the root's plan, one per executed tile.
    assert_eq!(fx.collaborators.butlers_built(), 1 + 4);
}

#[tokio::test]
async fn test_failing_tile_aborts_every_rank() {
    let engine = RecordingEngine::new().failing_tile(TileIndex { ix: 1, iy: 1 });
    let fx = Fixture::new(engine, &[1234], &[1234], false);

    let outcomes = fx.run(4).await;
    for outcome in &outcomes {
        let err = outcome.as_ref().unwrap_err();
        assert!(err.is_aborted(), "expected abort, got {}", err);
    }
    assert_eq!(LocalCluster::exit_status(&outcomes), 1);
    assert!(fx.engine.finalized().is_empty());
}

#[tokio::test]
async fn test_failing_measurement_aborts_every_rank() {
    let fx = Fixture::new(RecordingEngine::new(), &[1234], &[1234], true);
    let _ = fx.engine.clone().failing_file(fx.calexp(1234, 4));

    let outcomes = fx.run(3).await;
    assert!(outcomes.iter().all(|o| o.as_ref().is_err_and(|e| e.is_aborted())));
    assert!(fx.engine.executed().is_empty());
}
