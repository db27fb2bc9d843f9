//! Error types for the cinnabar plugin runtime

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cinnabar.
///
/// The whole enum is `Clone` because a single in-flight load failure has to
/// be replayed to every importer waiting on the same load token. I/O errors
/// are therefore carried as strings rather than `std::io::Error`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An import would re-enter a module that is already on the active
    /// load stack. Fatal to that import only; the rest of the graph is
    /// untouched.
    #[error("import cycle: {} is already on the active load stack ({})", .path.display(), format_chain(.chain))]
    Cycle {
        /// The canonical path whose import would close the cycle.
        path: PathBuf,
        /// The chain of canonical paths currently loading, outermost first.
        chain: Vec<PathBuf>,
    },

    /// A hook-registration primitive was invoked outside any module
    /// evaluation context. Recoverable by the caller.
    #[error("no dependency is currently loading")]
    NoActiveDependency,

    /// An import was attempted while dispose hooks were running.
    #[error("cannot import '{0}' while disposal is in progress")]
    DisposeReentrancy(String),

    /// An unload targeted a node that carries no root pin.
    #[error("{0} has no root pin to release")]
    NotPinned(String),

    /// Module source could not be located for a specifier.
    #[error("module not found: {0}")]
    NotFound(String),

    /// A specifier could not be resolved to a canonical path.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// A module body failed during evaluation.
    #[error("module error: {0}")]
    Module(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Convenience constructor for module body failures.
    pub fn module(message: impl Into<String>) -> Self {
        Error::Module(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
