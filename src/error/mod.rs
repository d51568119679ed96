use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

use crate::comm::CommError;
use crate::subprocess::ProcessError;

/// The unified error type for the stacking driver
#[derive(Error, Debug)]
pub enum StackError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Communication error: {message}")]
    Comm {
        code: u16,
        message: String,
        peer: Option<usize>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Storage error: {message}")]
    Storage {
        code: u16,
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Engine error: {message}")]
    Engine {
        code: u16,
        message: String,
        operation: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Phase error: {message}")]
    Phase {
        code: u16,
        message: String,
        phase: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Job aborted with status {status}")]
    Aborted { code: u16, status: i32 },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StackError {
    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a communication error with specific code and peer rank
    pub fn comm_with_code(code: u16, message: impl Into<String>, peer: Option<usize>) -> Self {
        Self::Comm {
            code,
            message: message.into(),
            peer,
            source: None,
        }
    }

    /// Create a storage error with default code
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            code: ErrorCode::STORAGE_GENERIC,
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a storage error with specific code and path
    pub fn storage_with_code(code: u16, message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            path,
            source: None,
        }
    }

    /// Create an engine error with specific code and operation
    pub fn engine_with_code(
        code: u16,
        message: impl Into<String>,
        operation: Option<String>,
    ) -> Self {
        Self::Engine {
            code,
            message: message.into(),
            operation,
            source: None,
        }
    }

    /// Create a phase error with specific code and phase name
    pub fn phase_with_code(code: u16, message: impl Into<String>, phase: impl Display) -> Self {
        Self::Phase {
            code,
            message: message.into(),
            phase: Some(phase.to_string()),
            source: None,
        }
    }

    /// Marker error returned by every rank once the job has been aborted
    pub fn aborted(status: i32) -> Self {
        Self::Aborted {
            code: ErrorCode::COMM_ABORTED,
            status,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Comm { source: src, .. }
            | Self::Storage { source: src, .. }
            | Self::Engine { source: src, .. }
            | Self::Phase { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
            Self::Aborted { .. } => {}
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Comm { message, .. }
            | Self::Storage { message, .. }
            | Self::Engine { message, .. }
            | Self::Phase { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
            Self::Aborted { .. } => {}
        }
        self
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Aborted { status, .. } => *status,
            _ => 1,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::Comm { code, .. }
            | Self::Storage { code, .. }
            | Self::Engine { code, .. }
            | Self::Phase { code, .. }
            | Self::Aborted { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// Short name of the error category, used when reporting a rank failure
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "ConfigError",
            Self::Comm { .. } => "CommError",
            Self::Storage { .. } => "StorageError",
            Self::Engine { .. } => "EngineError",
            Self::Phase { .. } => "PhaseError",
            Self::Aborted { .. } => "Aborted",
            Self::Other { .. } => "Error",
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { message, .. } => format!("Configuration problem: {}", message),
            Self::Comm { message, peer, .. } => match peer {
                Some(rank) => format!("Communication with rank {} failed: {}", rank, message),
                None => format!("Communication error: {}", message),
            },
            Self::Storage { message, path, .. } => match path {
                Some(p) => format!("Storage error at {}: {}", p.display(), message),
                None => format!("Storage error: {}", message),
            },
            Self::Engine {
                message, operation, ..
            } => match operation {
                Some(op) => format!("Engine operation '{}' failed: {}", op, message),
                None => format!("Engine error: {}", message),
            },
            Self::Phase { message, phase, .. } => match phase {
                Some(p) => format!("{} phase failed: {}", p, message),
                None => format!("Phase error: {}", message),
            },
            Self::Aborted { status, .. } => format!("Job aborted (status {})", status),
            Self::Other { message, .. } => message.clone(),
        }
    }

    /// Get a developer-friendly error message with full chain
    pub fn developer_message(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(&format!("\n  caused by: {}", cause));
            source = cause.source();
        }
        out
    }

    /// Whether this error is the abort marker
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Type alias for Results using StackError
pub type Result<T> = std::result::Result<T, StackError>;

impl From<std::io::Error> for StackError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, message) = match err.kind() {
            ErrorKind::NotFound => (ErrorCode::STORAGE_NOT_FOUND, "File or directory not found"),
            ErrorKind::PermissionDenied => {
                (ErrorCode::STORAGE_PERMISSION_DENIED, "Permission denied")
            }
            _ => (ErrorCode::STORAGE_IO_ERROR, "IO operation failed"),
        };

        StackError::storage_with_code(code, message, None).with_source(err)
    }
}

impl From<serde_json::Error> for StackError {
    fn from(err: serde_json::Error) -> Self {
        StackError::storage_with_code(
            ErrorCode::STORAGE_SERIALIZATION_ERROR,
            "Invalid JSON data",
            None,
        )
        .with_source(err)
    }
}

impl From<toml::de::Error> for StackError {
    fn from(err: toml::de::Error) -> Self {
        StackError::config_with_code(ErrorCode::CONFIG_INVALID_SETTINGS, "Invalid TOML syntax")
            .with_source(err)
    }
}

impl From<CommError> for StackError {
    fn from(err: CommError) -> Self {
        let (code, peer) = match &err {
            CommError::Aborted(status) => return StackError::aborted(*status),
            CommError::Disconnected(rank) => (ErrorCode::COMM_DISCONNECTED, Some(*rank)),
            CommError::InvalidRank { rank, .. } => (ErrorCode::COMM_PROTOCOL, Some(*rank)),
            CommError::Protocol(_) => (ErrorCode::COMM_PROTOCOL, None),
            CommError::Serialization(_) => (ErrorCode::COMM_SERIALIZATION, None),
            CommError::Io(_) => (ErrorCode::COMM_GENERIC, None),
            CommError::ConnectFailed { .. } => (ErrorCode::COMM_CONNECT_FAILED, None),
        };
        StackError::comm_with_code(code, err.to_string(), peer).with_source(err)
    }
}

impl From<ProcessError> for StackError {
    fn from(err: ProcessError) -> Self {
        let code = match &err {
            ProcessError::CommandNotFound(_) => ErrorCode::ENGINE_COMMAND_NOT_FOUND,
            ProcessError::Timeout { .. } => ErrorCode::ENGINE_TIMEOUT,
            ProcessError::Spawn { .. } => ErrorCode::ENGINE_SPAWN_FAILED,
            ProcessError::Io(_) => ErrorCode::ENGINE_FAILED,
            ProcessError::Unscripted(_) => ErrorCode::ENGINE_GENERIC,
        };
        StackError::engine_with_code(code, err.to_string(), None).with_source(err)
    }
}
