//! Error type shared by the emulation core.
//!
//! Register accesses never fail; errors only surface at construction
//! (configuration), at the persistence boundary (EEPROM images, save states)
//! and while parsing bench scripts.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to the process boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration, detected before any component is started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A file could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed Intel HEX input.
    #[error("intel hex line {line}: {message}")]
    Hex { line: usize, message: String },

    /// Writing the EEPROM image back failed. Always fatal.
    #[error("eeprom commit to {} failed: {source}", path.display())]
    Commit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A background worker could not be started.
    #[error("could not start {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    /// Save state could not be encoded, decoded or validated.
    #[error("save state: {0}")]
    SaveState(String),

    /// Bench script syntax error.
    #[error("script line {line}: {message}")]
    Script { line: usize, message: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
