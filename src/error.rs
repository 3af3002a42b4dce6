//! Error types for the telemetry pipeline

use std::io;
use thiserror::Error;

/// Result type alias for asmon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// Only the fatal subset (see [`Error::is_fatal`]) ever halts the pipeline. Everything else
/// is absorbed by the layer that detects it: the supervisor restarts the sampler, the
/// pipeline skips a record, the extractor carries a field forward.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Nix error (Unix signal delivery)
    #[cfg(unix)]
    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),

    /// The sampler process could not be launched
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Detected hardware has no profile and no fallback
    #[error("Unsupported hardware: {0}")]
    UnsupportedHardware(String),

    /// Unsupported platform
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// A record could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feature not supported by the sampler or platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Supervisor control-plane failure
    #[error("Supervisor error: {0}")]
    Supervisor(String),
}

impl Error {
    /// Whether this error must abort startup instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Spawn { .. }
                | Error::PermissionDenied(_)
                | Error::UnsupportedHardware(_)
                | Error::UnsupportedPlatform(_)
                | Error::Config(_)
        )
    }
}
