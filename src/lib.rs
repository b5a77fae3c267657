//! Hashstore - content-addressed blob store over HTTP
//!
//! Clients upload arbitrary bytes and get back the content hash, which is the
//! permanent key for fetching or deleting the blob later.
//!
//! ## Storage Layout
//!
//! ```text
//! <storage_dir>/
//! ├── 2c/                    # Shard: first 2 hex chars of the hash
//! │   └── 2cf24dba5f...      # Blob, named by its full hash
//! └── tmp/                   # Staging files of in-flight uploads
//! ```
//!
//! ## Guarantees
//!
//! - A blob never appears partially written under its final name
//! - Concurrent uploads of the same bytes converge to one file
//! - Shard directories are removed as soon as their last blob is deleted
//! - Failed or truncated uploads leave nothing behind in `tmp/`

pub mod blob_store;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod identifier;
pub mod pid_lock;
pub mod publish_lock;

// Re-exports
pub use blob_store::{
    BlobReader, BlobStore, BlobStoreConfig, DeleteOutcome, PublishStrategy, StorageStats,
    StoreOutcome,
};
pub use config::Config;
pub use error::StorageError;
pub use http::HttpServer;
pub use identifier::{BlobId, HashAlgorithm};
pub use pid_lock::PidLock;
