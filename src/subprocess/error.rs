use std::time::Duration;

/// Failure to run a child process at all; a child that ran and exited
/// non-zero is reported through its [`super::ExitStatus`] instead
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("{program} did not finish within {limit:?}")]
    Timeout { program: String, limit: Duration },

    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to child process: {0}")]
    Io(#[from] std::io::Error),

    #[error("no scripted reply for: {0}")]
    Unscripted(String),
}
