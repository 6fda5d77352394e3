use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Central error type for the nocturne engine.
#[derive(Debug, Error)]
pub enum NocturneError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The readiness multiplexer failed for a reason other than a signal.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// The worker pool no longer accepts tasks.
    #[error("worker pool is shutting down")]
    PoolShutdown,
}

pub type NocturneResult<T> = Result<T, NocturneError>;
