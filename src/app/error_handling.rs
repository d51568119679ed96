//! Error handling utilities

use crate::error::StackError;
use tracing::error;

/// Exit status for an error that reached `main`
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<StackError>() {
        Some(err) => err.exit_code(),
        None => 1,
    }
}

/// Handle fatal errors and exit with appropriate status code
///
/// - `verbose = 0`: user-facing message only
/// - `verbose >= 1`: the full error chain as well
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);

    if let Some(stack_err) = error.downcast_ref::<StackError>() {
        eprintln!("{}", stack_err.user_message());
        if verbose >= 1 {
            eprintln!("\nContext Chain:\n{}", stack_err.developer_message());
        }
    } else {
        eprintln!("Error: {error}");
        if verbose >= 1 {
            eprintln!("\nError chain:");
            for (i, cause) in error.chain().enumerate() {
                eprintln!("  {}: {}", i, cause);
            }
        }
    }

    std::process::exit(exit_code_for(&error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_config_errors_exit_with_usage_status() {
        let err = anyhow::Error::new(StackError::config_with_code(
            ErrorCode::CONFIG_UNKNOWN_INSTRUMENT,
            "unknown instrument: lsst",
        ));
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_abort_status_is_preserved() {
        let err = anyhow::Error::new(StackError::aborted(1));
        assert_eq!(exit_code_for(&err), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain failure")), 1);
    }
}
