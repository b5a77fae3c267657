//! End-to-end tests for the HTTP API
//!
//! Each test starts a real server on an ephemeral port and talks raw
//! HTTP/1.1 over a TCP socket, so truncated uploads can be simulated.

use hashstore::{BlobStore, BlobStoreConfig, HttpServer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

/// Parsed response
struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Helper to start a server over a fresh store in `root`
async fn start_server(root: &Path) -> SocketAddr {
    let store = Arc::new(BlobStore::open(BlobStoreConfig::new(root)).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Arc::new(HttpServer::new(store));
    tokio::spawn(server.serve(listener));

    addr
}

fn build_request(method: &str, path: &str, body: Option<&[u8]>) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n", method, path);
    if let Some(body) = body {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    if let Some(body) = body {
        bytes.extend_from_slice(body);
    }
    bytes
}

fn parse_response(raw: &[u8]) -> RawResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has no header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    RawResponse {
        status,
        headers,
        body,
    }
}

async fn send_raw(addr: SocketAddr, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

async fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&[u8]>) -> RawResponse {
    send_raw(addr, &build_request(method, path, body)).await
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_store_fetch_delete_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    let response = send(addr, "POST", "/", Some(&b"hello"[..])).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), format!("{}\n", HELLO_SHA256));

    let response = send(addr, "GET", &format!("/{}", HELLO_SHA256), None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
    assert_eq!(response.header("content-type"), Some("application/octet-stream"));
    assert_eq!(response.header("content-length"), Some("5"));
    assert_eq!(
        response.header("content-disposition"),
        Some(format!("attachment; filename=\"{}\"", HELLO_SHA256).as_str())
    );

    let response = send(addr, "DELETE", &format!("/{}", HELLO_SHA256), None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), format!("Deleted {}\n", HELLO_SHA256));

    let response = send(addr, "GET", &format!("/{}", HELLO_SHA256), None).await;
    assert_eq!(response.status, 404);

    // Only the staging directory is left
    assert!(!temp_dir.path().join("2c").exists());
    assert_eq!(count_entries(temp_dir.path()), 1);
}

#[tokio::test]
async fn test_duplicate_upload_conflicts() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    assert_eq!(send(addr, "POST", "/", Some(&b"hello"[..])).await.status, 200);

    let response = send(addr, "POST", "/", Some(&b"hello"[..])).await;
    assert_eq!(response.status, 409);
    assert!(response.text().contains(HELLO_SHA256));

    assert_eq!(count_entries(&temp_dir.path().join("2c")), 1);
    assert_eq!(count_entries(&temp_dir.path().join("tmp")), 0);
}

#[tokio::test]
async fn test_large_blob_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(
        BlobStore::open(BlobStoreConfig {
            chunk_size: 4096,
            ..BlobStoreConfig::new(temp_dir.path())
        })
        .await
        .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::new(HttpServer::new(store)).serve(listener));

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let response = send(addr, "POST", "/", Some(payload.as_slice())).await;
    assert_eq!(response.status, 200);
    let id = response.text().trim().to_string();

    let response = send(addr, "GET", &format!("/{}", id), None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), payload.len());
    assert_eq!(response.body, payload);
}

#[tokio::test]
async fn test_invalid_identifiers() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    let upper = format!("/{}", HELLO_SHA256.to_uppercase());
    for path in ["/", "/abc", "/..%2F..%2Fetc", "/2c/2cf24dba", upper.as_str()] {
        assert_eq!(send(addr, "GET", path, None).await.status, 400, "GET {}", path);
        assert_eq!(send(addr, "DELETE", path, None).await.status, 400, "DELETE {}", path);
    }
}

#[tokio::test]
async fn test_unknown_identifier_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    let path = format!("/{}", HELLO_SHA256);
    let response = send(addr, "GET", &path, None).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), format!("Blob {} not found\n", HELLO_SHA256));

    assert_eq!(send(addr, "DELETE", &path, None).await.status, 404);
}

#[tokio::test]
async fn test_post_without_length() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    let request = b"POST / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    let response = send_raw(addr, request).await;
    assert_eq!(response.status, 411);
}

#[tokio::test]
async fn test_unsupported_method() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    let response = send(addr, "PUT", "/", Some(&b"hello"[..])).await;
    assert_eq!(response.status, 405);
}

#[tokio::test]
async fn test_head_and_health() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    send(addr, "POST", "/", Some(&b"hello"[..])).await;

    let response = send(addr, "HEAD", &format!("/{}", HELLO_SHA256), None).await;
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());

    let response = send(addr, "GET", "/health", None).await;
    assert_eq!(response.status, 200);
    let health: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["blobs"], 1);
}

#[tokio::test]
async fn test_truncated_upload_leaves_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    // Declare 100 bytes, send 5, then hang up the write side
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 100\r\n\r\nhello")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw).await;
    if !raw.is_empty() {
        assert_eq!(parse_response(&raw).status, 500);
    }

    // The handler may finish just after the connection closes
    let staging = temp_dir.path().join("tmp");
    let mut waited = Duration::ZERO;
    while count_entries(&staging) > 0 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    assert_eq!(count_entries(&staging), 0);
    assert_eq!(count_entries(temp_dir.path()), 1);
    assert!(!temp_dir.path().join("2c").exists());
}

#[tokio::test]
async fn test_concurrent_clients() {
    let temp_dir = TempDir::new().unwrap();
    let addr = start_server(temp_dir.path()).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        handles.push(tokio::spawn(async move {
            let payload = format!("payload-{}", i % 4).into_bytes();
            send(addr, "POST", "/", Some(payload.as_slice())).await.status
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            200 => created += 1,
            409 => conflicts += 1,
            other => panic!("unexpected status {}", other),
        }
    }

    assert_eq!(created, 4);
    assert_eq!(conflicts, 12);
    assert_eq!(count_entries(&temp_dir.path().join("tmp")), 0);
}
