//! Common error types for the ibex launcher.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`IbexError`].
pub type IbexResult<T> = Result<T, IbexError>;

/// Errors across the ibex launcher.
///
/// The variants fall into four groups: configuration errors are detected
/// before any OS-level action; resource errors fail a single operation;
/// handshake errors carry the best diagnostic the external runtime left
/// behind; cleanup failures are logged where they occur and never surface
/// through this type.
#[derive(Error, Diagnostic, Debug)]
pub enum IbexError {
    /// Invalid launch configuration.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(ibex::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Subordinate ID range is missing or too small for rootless mapping.
    #[error("Subordinate {kind} range for user {user} is too small: {size} < 65536")]
    #[diagnostic(
        code(ibex::idmap::range),
        help("Add at least 65536 subordinate IDs in /etc/sub{kind} for this user")
    )]
    SubIdRange {
        /// "uid" or "gid".
        kind: String,
        /// The user the range was looked up for.
        user: String,
        /// The size that was found (0 when no entry exists).
        size: u32,
    },

    /// Another launcher holds the bundle lock.
    #[error("Bundle is locked: {path}")]
    #[diagnostic(
        code(ibex::bundle::locked),
        help("Another launch is in flight for this bundle; use a different bundle path")
    )]
    BundleLocked {
        /// Path of the lock file that already exists.
        path: PathBuf,
    },

    /// A required external binary was not found.
    #[error("Required binary not found: {binary}")]
    #[diagnostic(code(ibex::binary::not_found))]
    BinaryNotFound {
        /// Name of the missing binary.
        binary: String,
    },

    /// A CDI device selector did not resolve.
    #[error("CDI device not found: {selector}")]
    #[diagnostic(
        code(ibex::cdi::not_found),
        help("Check the selector spelling and the directories passed via --cdi-dirs")
    )]
    DeviceNotFound {
        /// The unresolved selector.
        selector: String,
    },

    /// The create handshake with the logging helper timed out.
    #[error("Timed out after {seconds}s waiting for container creation")]
    #[diagnostic(code(ibex::handshake::timeout))]
    HandshakeTimeout {
        /// The fixed timeout that elapsed.
        seconds: u64,
    },

    /// The logging helper reported a failure over the sync pipe.
    #[error("Container creation failed: {message}")]
    #[diagnostic(code(ibex::handshake::failed))]
    HandshakeFailed {
        /// Negative status from the sync message.
        status: i32,
        /// Diagnostic extracted from the runtime log, or a generic message.
        message: String,
    },

    /// The external runtime exited with a failure.
    #[error("{runtime} {operation} failed for container {id}: {message}")]
    #[diagnostic(code(ibex::runtime::failed))]
    RuntimeFailed {
        /// Runtime binary name.
        runtime: String,
        /// The lifecycle operation that failed.
        operation: String,
        /// Container ID.
        id: String,
        /// Captured stderr or exit description.
        message: String,
    },

    /// Container not found in the state directory.
    #[error("Container not found: {id}")]
    #[diagnostic(code(ibex::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ibex::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(ibex::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(ibex::internal),
        help("This is a bug, please report it at https://github.com/ibex-hpc/ibex/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl IbexError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for IbexError {
    fn from(err: serde_json::Error) -> Self {
        IbexError::Serialization(err.to_string())
    }
}
