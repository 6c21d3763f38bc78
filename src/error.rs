/// Error handling module for devserver-runner.
///
/// This module defines the error types used throughout the library.
/// Every failure of [`DevServerManager::acquire`](crate::DevServerManager::acquire)
/// surfaces as one of these variants after any partially started process
/// has been stopped.
///
/// # Example
///
/// ```
/// use devserver_runner::error::{Error, Result};
/// use devserver_runner::ResolvedAddress;
///
/// fn describe(result: Result<ResolvedAddress>) -> String {
///     match result {
///         Ok(address) => format!("dev server answering on {}", address),
///         Err(Error::ProcessExited { status, .. }) => format!("dev server crashed ({})", status),
///         Err(Error::HealthCheckTimeout { elapsed, .. }) => format!("dev server slow to start ({:?})", elapsed),
///         Err(e) => format!("dev server unavailable: {}", e),
///     }
/// }
/// ```
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the devserver-runner library.
///
/// Each variant includes enough context to tell a user whether the dev
/// server crashed, was slow to start, or was misconfigured.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON or YAML is malformed
    /// - Field types are incorrect
    /// - The file cannot be read
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains values that cannot be used.
    ///
    /// This error occurs when:
    /// - The check timeout is below 1000ms
    /// - A managed dev server has no start command
    /// - An unmanaged dev server has no port
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The dev server process could not be launched.
    #[error("Failed to start dev server `{command}`: {reason}")]
    Spawn {
        /// The command as it was configured
        command: String,
        /// The OS-level reason
        reason: String,
    },

    /// The dev server did not answer its health check before the deadline.
    #[error("Dev server did not become ready within {elapsed:?} (last error: {last_error})")]
    HealthCheckTimeout {
        /// Time spent polling
        elapsed: Duration,
        /// The error reported by the last probe
        last_error: String,
    },

    /// The dev server process died before it became healthy.
    #[error("Dev server process exited before becoming ready after {elapsed:?} ({status})")]
    ProcessExited {
        /// Exit status as reported by the OS
        status: String,
        /// Time between spawn and the exit being observed
        elapsed: Duration,
    },

    /// An unmanaged dev server was expected but nothing answered.
    #[error("The dev server (configured as not managed) is not started on {host}:{port}")]
    UnmanagedServerNotFound {
        /// Configured host
        host: String,
        /// Configured port
        port: u16,
    },

    /// A start in progress was cancelled by a concurrent release.
    #[error("Dev server start interrupted: {0}")]
    Interrupted(String),

    /// Error while operating on a spawned process.
    ///
    /// This error occurs when:
    /// - Sending a signal to the process fails
    /// - Waiting for the process to exit fails
    #[error("Dev server process error: {0}")]
    Process(String),

    /// No dev server is currently running.
    #[error("No dev server is running")]
    NotRunning,

    /// Forwarding a request to the dev server failed.
    #[error("Forwarding error: {0}")]
    Forward(String),

    /// The request cannot be handled by the forwarding handler.
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for devserver-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module.
pub type Result<T> = std::result::Result<T, Error>;
