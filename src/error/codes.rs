/// Error code registry for the stacking driver
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Communication errors
/// - 3000-3999: Storage errors
/// - 4000-4999: Engine errors
/// - 5000-5999: Phase errors
/// - 9000-9999: Other errors
#[allow(dead_code)]
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_MISSING_REQUIRED: u16 = 1001;
    pub const CONFIG_UNKNOWN_INSTRUMENT: u16 = 1002;
    pub const CONFIG_INVALID_SETTINGS: u16 = 1003;
    pub const CONFIG_INVALID_ENV: u16 = 1004;
    pub const CONFIG_INVALID_VALUE: u16 = 1005;

    // Communication errors (2000-2999)
    pub const COMM_GENERIC: u16 = 2000;
    pub const COMM_ABORTED: u16 = 2001;
    pub const COMM_DISCONNECTED: u16 = 2002;
    pub const COMM_PROTOCOL: u16 = 2003;
    pub const COMM_SERIALIZATION: u16 = 2004;
    pub const COMM_CONNECT_FAILED: u16 = 2005;

    // Storage errors (3000-3999)
    pub const STORAGE_GENERIC: u16 = 3000;
    pub const STORAGE_IO_ERROR: u16 = 3001;
    pub const STORAGE_NOT_FOUND: u16 = 3002;
    pub const STORAGE_PERMISSION_DENIED: u16 = 3003;
    pub const STORAGE_UNKNOWN_DATASET: u16 = 3004;
    pub const STORAGE_SERIALIZATION_ERROR: u16 = 3005;
    pub const STORAGE_READ_ONLY: u16 = 3006;

    // Engine errors (4000-4999)
    pub const ENGINE_GENERIC: u16 = 4000;
    pub const ENGINE_COMMAND_NOT_FOUND: u16 = 4001;
    pub const ENGINE_FAILED: u16 = 4002;
    pub const ENGINE_TIMEOUT: u16 = 4003;
    pub const ENGINE_BAD_RESPONSE: u16 = 4004;
    pub const ENGINE_SPAWN_FAILED: u16 = 4005;

    // Phase errors (5000-5999)
    pub const PHASE_GENERIC: u16 = 5000;
    pub const PHASE_DISCOVER_FAILED: u16 = 5001;
    pub const PHASE_INITIALIZE_FAILED: u16 = 5002;
    pub const PHASE_MEASURE_FAILED: u16 = 5003;
    pub const PHASE_EXECUTE_FAILED: u16 = 5004;
    pub const PHASE_FINALIZE_FAILED: u16 = 5005;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_PANIC: u16 = 9001;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        ErrorCode::CONFIG_GENERIC => "General configuration error",
        ErrorCode::CONFIG_MISSING_REQUIRED => "A required argument or setting is missing",
        ErrorCode::CONFIG_UNKNOWN_INSTRUMENT => "The instrument name is not recognized",
        ErrorCode::CONFIG_INVALID_SETTINGS => "The settings file could not be parsed",
        ErrorCode::CONFIG_INVALID_ENV => "An environment variable has an invalid value",
        ErrorCode::CONFIG_INVALID_VALUE => "A configuration value is out of range",

        ErrorCode::COMM_GENERIC => "General communication error",
        ErrorCode::COMM_ABORTED => "The distributed job was aborted",
        ErrorCode::COMM_DISCONNECTED => "A rank disconnected unexpectedly",
        ErrorCode::COMM_PROTOCOL => "A rank sent an unexpected message",
        ErrorCode::COMM_SERIALIZATION => "A message could not be encoded or decoded",
        ErrorCode::COMM_CONNECT_FAILED => "Could not join the distributed world",

        ErrorCode::STORAGE_GENERIC => "General storage error",
        ErrorCode::STORAGE_IO_ERROR => "I/O operation failed",
        ErrorCode::STORAGE_NOT_FOUND => "Dataset or file not found",
        ErrorCode::STORAGE_PERMISSION_DENIED => "Permission denied",
        ErrorCode::STORAGE_UNKNOWN_DATASET => "The butler does not know this dataset type",
        ErrorCode::STORAGE_SERIALIZATION_ERROR => "Stored data could not be encoded or decoded",
        ErrorCode::STORAGE_READ_ONLY => "This data reference cannot read data",

        ErrorCode::ENGINE_GENERIC => "General engine error",
        ErrorCode::ENGINE_COMMAND_NOT_FOUND => "The engine executable was not found",
        ErrorCode::ENGINE_FAILED => "The engine reported a failure",
        ErrorCode::ENGINE_TIMEOUT => "The engine did not finish in time",
        ErrorCode::ENGINE_BAD_RESPONSE => "The engine returned a malformed response",
        ErrorCode::ENGINE_SPAWN_FAILED => "The engine process could not be started",

        ErrorCode::PHASE_GENERIC => "General phase error",
        ErrorCode::PHASE_DISCOVER_FAILED => "Input discovery failed",
        ErrorCode::PHASE_INITIALIZE_FAILED => "Stack initialization failed",
        ErrorCode::PHASE_MEASURE_FAILED => "PSF measurement failed",
        ErrorCode::PHASE_EXECUTE_FAILED => "Tile stacking failed",
        ErrorCode::PHASE_FINALIZE_FAILED => "Stack finalization failed",

        ErrorCode::OTHER_PANIC => "A rank panicked",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_have_descriptions() {
        assert_eq!(
            describe_error_code(ErrorCode::CONFIG_UNKNOWN_INSTRUMENT),
            "The instrument name is not recognized"
        );
        assert_eq!(
            describe_error_code(ErrorCode::COMM_ABORTED),
            "The distributed job was aborted"
        );
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(describe_error_code(12345), "Unknown error");
    }
}
