//! Crate-wide error type.
//!
//! Each module defines its own error enum for the failures it can
//! produce; this module aggregates them so callers that don't care
//! about the failure domain can work with a single `Result` alias.

use crate::config::ConfigError;
use crate::daemon::FlashError;
use crate::history::HistoryError;
use crate::registry::RegistryError;

/// Top-level error for daemon operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Convenient Result type for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;
