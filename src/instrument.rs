//! Instrument resolution and mapper setup
//!
//! The instrument decides how many detector chips an exposure has and where
//! its calibrated exposures live under a rerun.

use crate::butler::FsButler;
use crate::config::Settings;
use crate::error::{ErrorCode, Result, StackError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Camera the exposures were taken with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Instrument {
    /// Hyper Suprime-Cam
    Hsc,
    /// Suprime-Cam
    SuprimeCam,
}

impl Instrument {
    /// Resolve an instrument name, ignoring case.
    ///
    /// Accepts `hsc`, `suprimecam`, `suprime-cam` and `sc`.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "hsc" => Ok(Instrument::Hsc),
            "suprimecam" | "suprime-cam" | "sc" => Ok(Instrument::SuprimeCam),
            _ => Err(StackError::config_with_code(
                ErrorCode::CONFIG_UNKNOWN_INSTRUMENT,
                format!("unknown instrument: {}", name),
            )),
        }
    }

    /// Number of detector chips per exposure
    pub fn n_ccd(self) -> u32 {
        match self {
            Instrument::Hsc => 100,
            Instrument::SuprimeCam => 10,
        }
    }

    /// Every chip id of one exposure, `0..n_ccd`
    pub fn ccd_ids(self) -> Vec<u32> {
        (0..self.n_ccd()).collect()
    }

    /// Calibrated-exposure path relative to the rerun directory
    pub fn calexp_path(self, pointing: i64, filter: &str, visit: i64, ccd: u32) -> PathBuf {
        let name = match self {
            Instrument::Hsc => format!("CORR{:07}{:03}.fits", visit, ccd),
            Instrument::SuprimeCam => format!("CORR{:07}{}.fits", visit, ccd),
        };
        PathBuf::from(format!("{:05}", pointing))
            .join(filter)
            .join("corr")
            .join(name)
    }

    /// Build the data butler for this instrument and rerun
    pub fn mapper(self, rerun: &str, settings: &Settings) -> Result<FsButler> {
        FsButler::for_rerun(self, &settings.butler.data_root, rerun)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Hsc => write!(f, "hsc"),
            Instrument::SuprimeCam => write!(f, "suprimecam"),
        }
    }
}

impl FromStr for Instrument {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        Instrument::parse(s)
    }
}
