//! Error types for xmtest-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for xmtest-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// A create-class failure reported by the control tool.
///
/// Carries the tool's output and exit status so tests can assert on the
/// exact reason a domain did not come up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DomainError {
    /// Human-readable summary
    pub message: String,
    /// Raw control tool output
    pub extra: String,
    /// Control tool exit status, `-1` when unknown
    pub code: i32,
}

impl DomainError {
    /// Create an error with a known exit status.
    pub fn new(message: impl Into<String>, extra: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            extra: extra.into(),
            code,
        }
    }

    /// Create an error from exit status text; unparseable text maps to `-1`.
    pub fn with_code_text(
        message: impl Into<String>,
        extra: impl Into<String>,
        code: &str,
    ) -> Self {
        Self::new(message, extra, code.trim().parse().unwrap_or(-1))
    }
}

/// Device bookkeeping errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Identifier already registered on the domain
    #[error("domain {domain} already has device {id}")]
    Duplicate { domain: String, id: String },

    /// Identifier not registered on the domain
    #[error("device {id} not found for domain {domain}")]
    NotFound { domain: String, id: String },

    /// A device add hook exited nonzero
    #[error("device {id} hook `{command}` failed with code {code}: {output}")]
    HookFailed {
        id: String,
        command: String,
        code: i32,
        output: String,
    },
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Domain creation failed
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    /// Device error
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Device attach to a running domain
    #[error("attaching device {device} to running domain {domain} is not supported yet")]
    LiveAttachUnsupported { domain: String, device: String },

    /// Domain did not finish booting in time
    #[error("domain {domain} did not boot within {timeout:?}")]
    BootTimeout { domain: String, timeout: Duration },

    /// Console session error
    #[error("console error: {0}")]
    Console(String),

    /// Settings or architecture defaults could not be loaded
    #[error("settings error: {0}")]
    Settings(String),

    /// Error from xmtest-vm
    #[error("VM error: {0}")]
    Vm(#[from] xmtest_vm::VmError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_code_text() {
        let err = DomainError::with_code_text("Failed to create domain", "", "256");
        assert_eq!(err.code, 256);

        let err = DomainError::with_code_text("Failed to create domain", "", "not-a-number");
        assert_eq!(err.code, -1);
        assert_eq!(err.to_string(), "Failed to create domain");
    }

    #[test]
    fn test_duplicate_device_message() {
        let err = DeviceError::Duplicate {
            domain: "dom".into(),
            id: "eth0".into(),
        };
        assert_eq!(err.to_string(), "domain dom already has device eth0");
    }
}
