//! Hashstore Daemon
//!
//! Serves a content-addressed blob store over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8080, store under the local data dir)
//! hashstore
//!
//! # Start with custom config
//! hashstore --config /etc/hashstore.toml
//!
//! # Custom port and storage directory
//! hashstore --port 9000 --storage-dir /data/blobs
//! ```
//!
//! ## HTTP API
//!
//! - `POST /` - Store a blob, returns its hash
//! - `GET /{hash}` - Download a blob
//! - `HEAD /{hash}` - Check if a blob exists
//! - `DELETE /{hash}` - Delete a blob
//! - `GET /health` - Storage statistics
//!
//! The process stays in the foreground; run it under a supervisor.

use anyhow::Context;
use clap::Parser;
use hashstore::{BlobStore, Config, HashAlgorithm, HttpServer, PidLock};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hashstore")]
#[command(about = "Content-addressed blob store over HTTP")]
#[command(version)]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "HASHSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(short, long, env = "HASHSTORE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "HASHSTORE_HOST")]
    host: Option<IpAddr>,

    /// HTTP port
    #[arg(short, long, env = "HASHSTORE_PORT")]
    port: Option<u16>,

    /// Buffer size in bytes for streaming blob content
    #[arg(short = 'b', long, env = "HASHSTORE_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Lock file enforcing a single instance
    #[arg(long, env = "HASHSTORE_PID_FILE")]
    pid_file: Option<PathBuf>,

    /// Hash function for blob identifiers (sha256 or blake3)
    #[arg(long, env = "HASHSTORE_HASH_ALGORITHM")]
    hash_algorithm: Option<HashAlgorithm>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hashstore=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(pid_file) = args.pid_file {
        config.pid_file = pid_file;
    }
    if let Some(algorithm) = args.hash_algorithm {
        config.hash_algorithm = algorithm;
    }

    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        addr = %config.bind_addr(),
        algorithm = %config.hash_algorithm,
        "Starting hashstore"
    );

    let _pid_lock = PidLock::acquire(&config.pid_file).context("acquiring process lock")?;

    let blob_store = Arc::new(
        BlobStore::open(config.blob_store())
            .await
            .context("opening blob store")?,
    );

    // Bind before announcing so a taken port fails startup
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;

    let http_server = Arc::new(HttpServer::new(blob_store.clone()));

    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    // The accept loop only returns on failure; a supervisor must see a non-zero exit
    let served = tokio::select! {
        result = http_server.serve(listener) => {
            let e = match result {
                Ok(()) => anyhow::anyhow!("HTTP server stopped accepting connections"),
                Err(e) => anyhow::Error::new(e).context("HTTP server failed"),
            };
            error!(error = %e, "HTTP server error");
            Err(e)
        }
        _ = shutdown => Ok(()),
    };

    // Print stats before exit
    if let Ok(stats) = blob_store.stats().await {
        info!(
            blobs = stats.total_blobs,
            bytes = stats.total_bytes,
            suppressed_cleanup_errors = stats.suppressed_cleanup_errors,
            "Final storage stats"
        );
    }

    served
}
