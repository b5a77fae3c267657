//! Configuration for hashstore

use crate::blob_store::{BlobStoreConfig, PublishStrategy, DEFAULT_CHUNK_SIZE};
use crate::error::StorageError;
use crate::identifier::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hashstore")
}

/// Default process lock file
pub fn default_pid_file() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hashstore.pid")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the blob store
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Address to listen on
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Buffer size for streaming uploads and downloads
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Lock file enforcing a single running instance
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Hash function for blob identifiers. Changing it on an existing store
    /// makes previously stored blobs unreachable.
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// How finished uploads are moved into place
    #[serde(default)]
    pub publish_strategy: PublishStrategy,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_http_port() -> u16 {
    8080
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            host: default_host(),
            http_port: default_http_port(),
            chunk_size: default_chunk_size(),
            pid_file: default_pid_file(),
            hash_algorithm: HashAlgorithm::default(),
            publish_strategy: PublishStrategy::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| StorageError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.chunk_size == 0 {
            return Err(StorageError::Config("chunk_size must be greater than zero".into()));
        }
        Ok(())
    }

    /// Socket address for the HTTP listener
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.http_port)
    }

    /// Blob store settings derived from this config
    pub fn blob_store(&self) -> BlobStoreConfig {
        BlobStoreConfig {
            root_dir: self.storage_dir.clone(),
            chunk_size: self.chunk_size,
            hash_algorithm: self.hash_algorithm,
            publish_strategy: self.publish_strategy,
        }
    }
}
