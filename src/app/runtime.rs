//! Job startup
//!
//! Resolves the instrument and settings, then runs the driver on every rank
//! of either a TCP world (one rank per process, configured from the
//! environment) or an in-process cluster.

use crate::cli::{echo_arguments, Cli};
use crate::comm::{abort_on_error, Comm, LocalCluster, TcpTransport, WorldConfig};
use crate::config::Settings;
use crate::error::StackError;
use crate::instrument::Instrument;
use crate::stack::{Collaborators, ProductionCollaborators, StackDriver, StackReport, StackRequest};
use crate::subprocess::SubprocessManager;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, info_span, Instrument as _};

/// Name reported when a rank's entry point fails
pub const ENTRY_POINT: &str = "process_mosaic_stack";

/// Build the job request from parsed arguments and settings
pub fn build_request(cli: &Cli, instrument: Instrument, settings: &Settings) -> StackRequest {
    StackRequest {
        rerun: cli.rerun.clone(),
        instrument,
        program: cli.program.clone(),
        filter: cli.filter.clone(),
        date_obs: cli.date_obs.clone(),
        work_dir_root: cli.work_dir_root.clone(),
        dest_wcs: cli.dest_wcs.clone(),
        do_match_psf: cli.do_match_psf,
        stack: settings.stack.clone(),
    }
}

/// Run the whole job and return the process exit status.
///
/// Configuration problems are returned as errors before any rank starts.
pub async fn run(cli: Cli) -> Result<i32> {
    let instrument = Instrument::parse(&cli.instrument)?;
    let settings = Settings::load(cli.config.as_deref()).await?;
    let world = WorldConfig::from_env()?;
    echo_arguments(&cli);

    let request = build_request(&cli, instrument, &settings);
    let subprocess = SubprocessManager::production();
    let collaborators: Arc<dyn Collaborators> =
        Arc::new(ProductionCollaborators::new(settings, &subprocess));
    let driver = Arc::new(StackDriver::new(request, collaborators));

    match world {
        Some(world) => run_world(&world, driver).await,
        None => Ok(run_local(cli.ranks, driver).await?),
    }
}

/// Run every rank of an in-process cluster
pub async fn run_local(ranks: usize, driver: Arc<StackDriver>) -> crate::error::Result<i32> {
    let cluster = LocalCluster::new(ranks)?;
    info!("Running {} ranks in-process", cluster.size());

    let outcomes = cluster
        .run(move |comm| run_rank(comm, Arc::clone(&driver)))
        .await;
    if let Some(Ok(report)) = outcomes.first() {
        log_report(report);
    }
    Ok(LocalCluster::exit_status(&outcomes))
}

async fn run_world(world: &WorldConfig, driver: Arc<StackDriver>) -> Result<i32> {
    let transport = TcpTransport::join(world).await.map_err(StackError::from)?;
    let comm = Comm::new(Arc::new(transport));

    match run_rank(comm, driver).await {
        Ok(report) => {
            if world.rank == crate::stack::ROOT {
                log_report(&report);
            }
            Ok(0)
        }
        Err(err) => Ok(err.exit_code()),
    }
}

async fn run_rank(comm: Comm, driver: Arc<StackDriver>) -> crate::error::Result<StackReport> {
    let span = info_span!("rank", rank = comm.rank());
    abort_on_error(&comm, ENTRY_POINT, driver.run(&comm))
        .instrument(span)
        .await
}

fn log_report(report: &StackReport) {
    if let Some(kernel) = &report.kernel {
        info!(
            "PSF matched with {}x{} kernel (sigma {} / {})",
            kernel.width, kernel.height, kernel.sigma1, kernel.sigma2
        );
    }
    for record in &report.phases {
        info!(
            "{} (started {}): {:.2}s, {} processed, {} failed",
            record.phase,
            record.started_at.format("%H:%M:%S"),
            record.metrics.duration_secs,
            record.metrics.items_processed,
            record.metrics.items_failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{calexp_entries, InMemoryButler, RecordingEngine, TestCollaborators};
    use clap::Parser;
    use tempfile::TempDir;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec!["stack-exposures", "-r", "cosmos", "-p", "COSMOS_0", "-f", "W-S-I+"];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[test]
    fn test_request_carries_arguments_and_settings() {
        let mut settings = Settings::default();
        settings.stack.sub_img_size = 2048;
        let request = build_request(
            &cli(&["-d", "2008-01-02", "-w", "/work", "-m"]),
            Instrument::SuprimeCam,
            &settings,
        );
        assert_eq!(request.rerun, "cosmos");
        assert_eq!(request.instrument, Instrument::SuprimeCam);
        assert_eq!(request.date_obs.as_deref(), Some("2008-01-02"));
        assert_eq!(request.work_dir_root, std::path::PathBuf::from("/work"));
        assert!(request.do_match_psf);
        assert_eq!(request.stack.sub_img_size, 2048);
    }

    #[tokio::test]
    async fn test_unknown_instrument_fails_before_any_rank_runs() {
        let err = run(cli(&["-i", "lsst"])).await.unwrap_err();
        let stack_err = err.downcast_ref::<StackError>().unwrap();
        assert_eq!(stack_err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_run_local_exit_status() {
        let dir = TempDir::new().unwrap();
        let butler = InMemoryButler::new(Instrument::Hsc, dir.path().join("rerun/cosmos"))
            .with_entries(calexp_entries("COSMOS_0", "W-S-I+", 7, &[1], &[0, 1]));
        butler.touch_calexps().unwrap();

        let engine = RecordingEngine::new();
        let mut request = build_request(&cli(&[]), Instrument::Hsc, &Settings::default());
        request.work_dir_root = dir.path().join("work");

        let ok = Arc::new(StackDriver::new(
            request.clone(),
            Arc::new(TestCollaborators::with_butler(butler, engine.clone())),
        ));
        assert_eq!(run_local(3, ok).await.unwrap(), 0);
        assert_eq!(engine.executed().len(), 4);

        let failing = RecordingEngine::new().failing_tile(crate::stack::TileIndex { ix: 0, iy: 1 });
        let butler = InMemoryButler::new(Instrument::Hsc, dir.path().join("rerun/cosmos"))
            .with_entries(calexp_entries("COSMOS_0", "W-S-I+", 7, &[1], &[0, 1]));
        let bad = Arc::new(StackDriver::new(
            request,
            Arc::new(TestCollaborators::with_butler(butler, failing)),
        ));
        assert_eq!(run_local(2, bad).await.unwrap(), 1);
    }
}
