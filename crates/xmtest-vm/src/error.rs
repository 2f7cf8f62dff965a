//! Error types for xmtest-vm.

use thiserror::Error;

/// Result type alias for xmtest-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while preparing or invoking the control tool.
#[derive(Debug, Error)]
pub enum VmError {
    /// Control tool could not be run
    #[error("control tool error: {0}")]
    Tool(#[from] ToolError),

    /// Security policy hook failed
    #[error("security policy error: {0}")]
    Policy(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to run an external program at all.
///
/// A program that runs and exits nonzero is not an error at this layer;
/// its exit code is reported in [`crate::ToolOutput`].
#[derive(Debug, Error)]
pub enum ToolError {
    /// The process could not be spawned
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
