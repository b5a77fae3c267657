//! Error types for hashstore

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid blob identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another instance holds {} (pid {pid:?})", .path.display())]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },
}
