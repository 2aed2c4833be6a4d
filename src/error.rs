//! Error types for the modem engine.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use gsm_engine::{Engine, Result};
//!
//! async fn example(engine: &Engine) -> Result<()> {
//!     engine.network_attach("internet", "", "", true).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Command | [`Error::Failed`], [`Error::ModemError`], [`Error::CommandTimeout`], [`Error::InvalidArgument`] |
//! | Engine | [`Error::Memory`], [`Error::InProgress`], [`Error::BlockingNotAllowed`], [`Error::NotEnabled`], [`Error::DeviceNotPresent`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::NoFreeConnection`], [`Error::ConnectTimeout`], [`Error::ConnectFailed`], [`Error::NoIp`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

use crate::protocol::Cmd;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when engine configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Command Errors
    // ========================================================================
    /// Generic failure.
    ///
    /// The modem answered `ERROR` or `FAIL`, or a step failed without a
    /// more specific reason.
    #[error("Command failed")]
    Failed,

    /// Modem reported `+CME ERROR` or `+CMS ERROR`.
    #[error("Modem error {code}")]
    ModemError {
        /// Numeric error code reported by the modem.
        code: u16,
    },

    /// Invalid parameters passed to an operation.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// No terminal reply arrived within the message block time.
    #[error("Command {command:?} timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// Wire command in flight when the wait expired.
        command: Cmd,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Engine Errors
    // ========================================================================
    /// Out of memory or a mailbox is full.
    #[error("Out of memory: {message}")]
    Memory {
        /// What could not be allocated.
        message: String,
    },

    /// Operation already in progress.
    #[error("Operation in progress")]
    InProgress,

    /// A blocking call was made while holding the core lock.
    ///
    /// Returned when a listener callback issues a blocking operation.
    #[error("Blocking call not allowed from engine context")]
    BlockingNotAllowed,

    /// The requested feature is disabled in the engine options.
    #[error("Feature not enabled: {feature}")]
    NotEnabled {
        /// Name of the disabled feature.
        feature: &'static str,
    },

    /// Device is marked as not present.
    #[error("Device not present")]
    DeviceNotPresent,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection is closed or its handle is stale.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every connection slot is in use.
    #[error("No free connection slot")]
    NoFreeConnection,

    /// Modem did not report a connect result in time.
    #[error("Connection timeout")]
    ConnectTimeout,

    /// Modem reported a failed connect.
    #[error("Connection failed")]
    ConnectFailed,

    /// Device has no IP address assigned.
    #[error("No IP address")]
    NoIp,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error reported by the transport.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Completion channel dropped before a result was delivered.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an out-of-memory error.
    #[inline]
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Creates a command timeout error.
    #[inline]
    pub fn command_timeout(command: Cmd, timeout_ms: u64) -> Self {
        Self::CommandTimeout {
            command,
            timeout_ms,
        }
    }

    /// Creates a modem error from a CME/CMS code.
    #[inline]
    pub fn modem(code: u16) -> Self {
        Self::ModemError { code }
    }

    /// Creates a feature-not-enabled error.
    #[inline]
    pub fn not_enabled(feature: &'static str) -> Self {
        Self::NotEnabled { feature }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. } | Self::ConnectTimeout)
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::NoFreeConnection
                | Self::ConnectTimeout
                | Self::ConnectFailed
                | Self::NoIp
        )
    }

    /// Returns `true` if the modem itself rejected the command.
    #[inline]
    #[must_use]
    pub fn is_modem_error(&self) -> bool {
        matches!(self, Self::Failed | Self::ModemError { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. }
                | Self::ConnectTimeout
                | Self::Memory { .. }
                | Self::InProgress
                | Self::NoFreeConnection
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::command_timeout(Cmd::Cipstart, 5000);
        assert_eq!(err.to_string(), "Command Cipstart timed out after 5000ms");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("max_conns must be positive");
        assert_eq!(
            err.to_string(),
            "Configuration error: max_conns must be positive"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::command_timeout(Cmd::Csq, 1000);
        let other_err = Error::Failed;

        assert!(timeout_err.is_timeout());
        assert!(Error::ConnectTimeout.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::NoFreeConnection.is_connection_error());
        assert!(Error::ConnectFailed.is_connection_error());
        assert!(!Error::DeviceNotPresent.is_connection_error());
    }

    #[test]
    fn test_is_modem_error() {
        assert!(Error::modem(10).is_modem_error());
        assert!(Error::Failed.is_modem_error());
        assert!(!Error::BlockingNotAllowed.is_modem_error());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::memory("producer mailbox full").is_recoverable());
        assert!(!Error::config("test").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::BrokenPipe, "uart gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
