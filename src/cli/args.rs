//! CLI argument structures
//!
//! Flag names follow the pipeline's historical spelling (`--dateObs`,
//! `--workDirRoot`, ...); kebab-case aliases are accepted as well.

use clap::Parser;
use std::path::PathBuf;

/// Stack calibrated exposures of one field and filter into a mosaic
#[derive(Parser, Debug, Clone)]
#[command(name = "stack-exposures")]
#[command(about = "stack-exposures - Co-add calibrated exposures across ranks", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Rerun holding the calibrated exposures
    #[arg(short = 'r', long)]
    pub rerun: String,

    /// Instrument name (hsc, suprimecam, suprime-cam or sc)
    #[arg(short = 'i', long, default_value = "hsc")]
    pub instrument: String,

    /// Observing program, used as the field name in metadata queries
    #[arg(short = 'p', long)]
    pub program: String,

    /// Filter name
    #[arg(short = 'f', long)]
    pub filter: String,

    /// Restrict frames to one observation date
    #[arg(short = 'd', long = "dateObs", alias = "date-obs")]
    pub date_obs: Option<String>,

    /// Root under which `{program}/{filter}` is created
    #[arg(short = 'w', long = "workDirRoot", alias = "work-dir-root", default_value = ".")]
    pub work_dir_root: PathBuf,

    /// WCS file to stack onto instead of deriving one
    #[arg(short = 's', long = "destWcs", alias = "dest-wcs")]
    pub dest_wcs: Option<PathBuf>,

    /// Match every input to a common PSF before co-adding
    #[arg(short = 'm', long = "doMatchPsf", alias = "do-match-psf")]
    pub do_match_psf: bool,

    /// Ranks to run in this process when no TCP world is configured
    #[arg(short = 'n', long, default_value = "1", value_parser = parse_ranks)]
    pub ranks: usize,

    /// Path to a settings file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_ranks(value: &str) -> Result<usize, String> {
    let ranks: usize = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if ranks == 0 {
        return Err("at least one rank is required".to_string());
    }
    Ok(ranks)
}
