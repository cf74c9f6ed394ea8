//! OTA agent - host-side driver for the update client
//!
//! This crate provides a command-line interface for:
//! - Running the update loop against a file-backed flash image
//! - Generating publisher keys and signing release images
//! - Writing starter configuration and comparing versions

pub mod cli;
pub mod flash_file;
pub mod host_device;

pub use cli::Cli;
pub use flash_file::FileFlash;
pub use host_device::{BootRecord, HostDevice};

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Verification failed - image hash or signature rejected
/// - 4: Connection failed - repository unreachable or misbehaving
/// - 5: Invalid input - bad arguments, configuration or key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Image failed verification (exit code 2)
    VerificationFailed = 2,
    /// Connection failed (exit code 4)
    ConnectionFailed = 4,
    /// Invalid input provided (exit code 5)
    InvalidInput = 5,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::VerificationFailed => "VERIFICATION_FAILED",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
        }
    }
}
