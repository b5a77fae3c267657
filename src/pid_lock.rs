//! Single-instance process lock
//!
//! The lock is a pid file created exclusively at startup and removed on
//! shutdown. The blob store sweeps its staging directory on open, which is
//! only safe while no other instance serves the same root.

use crate::error::StorageError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Held for the lifetime of the server process
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Create the pid file, failing if it already exists
    ///
    /// A stale file left by a killed process has to be removed by hand.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let pid = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
                return Err(StorageError::AlreadyRunning { path, pid });
            }
            Err(e) => return Err(e.into()),
        };

        let pid = std::process::id();
        if let Err(e) = writeln!(file, "{}", pid) {
            fs::remove_file(&path).ok();
            return Err(e.into());
        }

        info!(path = %path.display(), pid, "Acquired process lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}
