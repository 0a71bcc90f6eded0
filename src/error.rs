//! # Error Types
//!
//! This module defines all error types used throughout the library.
//!
//! The main [`Error`] enum covers all possible failure modes:
//!
//! | Variant | Cause | Recoverable? |
//! |---------|-------|--------------|
//! | [`Error::Io`] | Socket operation failure | Maybe (depends on the operation) |
//! | [`Error::Config`] | Invalid configuration | No (fix config) |
//! | [`Error::Protocol`] | Wire protocol violation | No (bug/incompatibility) |
//!
//! Connection-level faults (a peer resetting its socket, a client process
//! dying) are *not* errors at the crate boundary: the runtime disconnects the
//! affected client and keeps serving the rest. Only startup failures (cannot
//! bind the TCP, SD or IPC sockets) abort the runtime.

use std::fmt;
use std::io;

/// Result type alias using the library's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for all library operations.
#[derive(Debug)]
pub enum Error {
    /// Network I/O error (socket operations, bind failures).
    ///
    /// Wraps a [`std::io::Error`]. At startup this is fatal (address in use
    /// after exhausting the probe range, socket path not writable).
    Io(io::Error),

    /// Configuration error (invalid addresses, ports, paths).
    ///
    /// Indicates a problem with the provided
    /// [`DispatcherConfig`](crate::config::DispatcherConfig).
    Config(ConfigError),

    /// Protocol-level error (malformed frames, desynchronized framing).
    ///
    /// Indicates incompatibility with the remote peer or a bug. A protocol
    /// error on a connection tears that connection down.
    Protocol(ProtocolError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {}", e.message),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Configuration error
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Protocol-level error
#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Error {
    /// Shorthand for a [`Error::Protocol`] with the given message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::new(message))
    }

    /// Shorthand for a [`Error::Config`] with the given message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ConfigError::new(message))
    }
}
