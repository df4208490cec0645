//! Crate-wide error types that don't belong to a single module.

use thiserror::Error;

/// Top-level error returned by the exporter binary's startup path.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::LoadConfigError),
    #[error("cannot bind metrics listener: {0}")]
    Bind(#[from] std::io::Error),
}
