//! Error types for the game server

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Failures while loading the picture catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The directory or one of its files could not be read (includes NotFound)
    #[error("failed to read catalog at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The directory exists but holds no pictures
    #[error("no pictures found in {0}")]
    Empty(PathBuf),
}

/// Per-player socket faults. Local to one PlayerChannel.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Line(#[from] LinesCodecError),

    #[error("outbox full")]
    SlowConsumer,
}

/// Startup and accept-loop failures
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
