//! # mosaic-stack
//!
//! Distributed driver that co-adds calibrated exposures of one field and
//! filter into a tiled mosaic. Ranks exchange work over a small collective
//! layer; the pixel work itself is done by an external stacking engine.
//!
//! ## Usage
//!
//! ```bash
//! stack-exposures -r <rerun> -p <program> -f <filter> [-i hsc] [-m] [-n ranks]
//! ```
//!
//! ## Modules
//!
//! - `app` - Process startup, logging and the job runtime
//! - `butler` - Data access: metadata queries, file resolution, datasets
//! - `cli` - Command-line arguments
//! - `comm` - Collective communication (broadcast, scatter, abort)
//! - `config` - Settings file and environment overrides
//! - `engine` - Contracts of the external mosaic/stack engine
//! - `instrument` - Instrument resolution and mapper setup
//! - `stack` - Job configuration, per-rank workers and the phased driver
//! - `subprocess` - Process execution used by the engine
//! - `testing` - In-memory butler and recording engine for tests
pub mod app;
pub mod butler;
pub mod cli;
pub mod comm;
pub mod config;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod stack;
pub mod subprocess;

pub mod testing;
