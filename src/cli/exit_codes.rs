//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::error::NotchError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// A device failed a network-wide command
    pub const DEVICE_FAILURE: u8 = 3;

    /// Device command timed out
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Operation not legal in the current session state
    pub const INVALID_STATE: u8 = 9;

    /// Download failed
    pub const TRANSFER_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Another operation is in progress
    pub const DEVICE_BUSY: u8 = 13;

    /// Workout cannot be satisfied by the available devices
    pub const INCOMPATIBLE: u8 = 14;

    /// Workout or descriptor failed validation
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        Self::Error(io_exit_code(&err), err.to_string())
    }
}

impl From<&NotchError> for CliResult {
    fn from(err: &NotchError) -> Self {
        Self::Error(exit_code_for(err), err.to_string())
    }
}

impl From<&ConfigError> for CliResult {
    fn from(err: &ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Best-effort mapping of an `anyhow` chain to an exit code
impl From<&anyhow::Error> for CliResult {
    fn from(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| {
                if let Some(e) = cause.downcast_ref::<NotchError>() {
                    Some(exit_code_for(e))
                } else if cause.is::<ConfigError>() {
                    Some(ExitCodes::CONFIG_ERROR)
                } else {
                    cause.downcast_ref::<std::io::Error>().map(io_exit_code)
                }
            })
            .unwrap_or(ExitCodes::ERROR);
        Self::Error(code, format!("{err:#}"))
    }
}

fn io_exit_code(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

/// Exit code for a service error
pub fn exit_code_for(err: &NotchError) -> u8 {
    use crate::core::device::LinkError;

    match err {
        NotchError::InvalidState { .. } | NotchError::ModeMismatch { .. } => {
            ExitCodes::INVALID_STATE
        }
        NotchError::Compatibility(_) => ExitCodes::INCOMPATIBLE,
        NotchError::DeviceFailure(failure) => {
            if failure.failures.iter().all(|f| matches!(f.error, LinkError::Timeout(_))) {
                ExitCodes::TIMEOUT
            } else {
                ExitCodes::DEVICE_FAILURE
            }
        }
        NotchError::OperationInProgress { .. } => ExitCodes::DEVICE_BUSY,
        NotchError::Cancelled => ExitCodes::CANCELLED,
        NotchError::StaleDescriptor { .. } | NotchError::InvalidWorkout(_) => {
            ExitCodes::VALIDATION_FAILED
        }
        NotchError::DownloadFailed { .. } => ExitCodes::TRANSFER_FAILED,
        NotchError::NoDeviceFound(_) | NotchError::EmptyDeviceSet => ExitCodes::DEVICE_NOT_FOUND,
        NotchError::Discovery(_) => ExitCodes::DEVICE_FAILURE,
        NotchError::Sink(err) => io_exit_code(err),
        NotchError::TimerAlreadyArmed | NotchError::Abandoned => ExitCodes::INTERNAL_ERROR,
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Device failure",
        4 => "Device timeout",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Invalid session state",
        10 => "Download failed",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Operation in progress",
        14 => "Workout incompatible with devices",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11, 12, 13, 14, 17, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancellation::OperationKind;
    use crate::core::device::{CommandKind, DeviceAddress, LinkError};
    use crate::core::fanout::{DeviceFault, FanOutFailure};

    fn device_failure(error: LinkError) -> NotchError {
        NotchError::DeviceFailure(FanOutFailure {
            command: CommandKind::Connect,
            failures: vec![DeviceFault {
                address: DeviceAddress::new("01"),
                error,
            }],
            succeeded: Vec::new(),
        })
    }

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Device failure");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Device failure"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
    }

    #[test]
    fn test_service_error_codes() {
        assert_eq!(exit_code_for(&NotchError::Cancelled), ExitCodes::CANCELLED);
        assert_eq!(
            exit_code_for(&NotchError::OperationInProgress {
                requested: OperationKind::Init
            }),
            ExitCodes::DEVICE_BUSY
        );
        assert_eq!(exit_code_for(&device_failure(LinkError::Timeout(50))), ExitCodes::TIMEOUT);
        assert_eq!(
            exit_code_for(&device_failure(LinkError::Disconnected)),
            ExitCodes::DEVICE_FAILURE
        );
    }

    #[test]
    fn test_anyhow_chain_finds_service_error() {
        let err = anyhow::Error::new(NotchError::NoDeviceFound(10)).context("scanning");
        let result = CliResult::from(&err);
        assert_eq!(result.code(), ExitCodes::DEVICE_NOT_FOUND);
        assert!(result.message().is_some_and(|m| m.starts_with("scanning")));
    }
}
