// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use std::{io, os::unix::io::RawFd};
use thiserror::Error;

/// Result type alias that all evio public API functions use.
pub type Result<T> = std::result::Result<T, Error>;

/// Composite error type to encompass all error types evio produces.
///
/// Environmental failures surface here; contract violations (destroying a
/// handle from inside its own callback, calling loop-thread-only APIs off
/// thread) are bugs in the calling code and assert instead.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from the OS polling primitive or an internal descriptor.
    #[error("IO error occurred: {0}")]
    Io(#[from] io::Error),

    /// The requested engine name is not compiled into this build.
    #[error("unknown engine {0:?}")]
    UnknownEngine(String),

    /// The event has not been initialized yet.
    #[error("event is not initialized")]
    NotInitialized,

    /// `init` was called while the event is enabled.
    #[error("event is enabled; disable it before re-initializing")]
    AlreadyEnabled,

    /// Registering a descriptor with the engine failed.
    #[error("registering fd {fd} failed: {source}")]
    Register {
        /// The descriptor that could not be registered.
        fd: RawFd,
        /// The underlying OS error.
        source: io::Error,
    },

    /// Installing the process-wide handler for a signal failed.
    #[error("installing handler for signal {signo} failed: {source}")]
    SignalInstall {
        /// The signal number whose handler could not be installed.
        signo: i32,
        /// The underlying OS error.
        source: io::Error,
    },

    /// Every notification slot for this signal number is taken.
    #[error("no free notification slot for signal {0}")]
    SignalSlotsExhausted(i32),
}

impl Error {
    pub(crate) fn from_errno(errno: nix::errno::Errno) -> Error {
        Error::Io(io::Error::from_raw_os_error(errno as i32))
    }
}
