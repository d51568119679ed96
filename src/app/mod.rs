//! Application module
//!
//! Process startup, logging, fatal-error reporting and the job runtime.

pub mod config;
pub mod error_handling;
pub mod logging;
pub mod process;
pub mod runtime;

pub use config::AppConfig;
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
pub use process::configure_process;
pub use runtime::run;
