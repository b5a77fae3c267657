//! Request handlers for the blob API
//!
//! Map fetch/store/delete onto [`BlobStore`] calls and translate the typed
//! outcomes into HTTP responses. Identifiers are validated here, before the
//! store is touched; everything involving hashes or paths stays inside the
//! store.

use crate::blob_store::{BlobReader, BlobStore, DeleteOutcome, StoreOutcome};
use crate::error::StorageError;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{header, Response, StatusCode};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

/// Response body: either a small in-memory message or a streamed blob
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ResponseBody {
    full_body(Bytes::new())
}

/// Plain-text response with a trailing newline
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    let mut message = message.into();
    message.push('\n');

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, TEXT_PLAIN)
        .header(header::CONTENT_LENGTH, message.len())
        .body(full_body(message))
        .unwrap()
}

fn invalid_identifier(raw: &str) -> Response<ResponseBody> {
    debug!(raw = %raw, "Rejected invalid identifier");
    text_response(StatusCode::BAD_REQUEST, "Invalid blob identifier")
}

fn storage_failure(action: &str, e: &StorageError) -> Response<ResponseBody> {
    error!(action, error = %e, "Storage error");
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
}

/// Blob download response shared by GET and HEAD
fn blob_response(id: &str, len: u64, body: ResponseBody) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", id),
        )
        .header(header::ETAG, format!("\"{}\"", id))
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(body)
        .unwrap()
}

/// Stream an opened blob in `chunk_size` frames
fn stream_body(reader: BlobReader, chunk_size: usize) -> ResponseBody {
    let stream = ReaderStream::with_capacity(reader, chunk_size).map_ok(Frame::data);
    StreamBody::new(stream).boxed_unsync()
}

/// GET /{id}
pub async fn handle_fetch(store: &BlobStore, raw_id: &str) -> Response<ResponseBody> {
    let id = match store.parse_id(raw_id) {
        Ok(id) => id,
        Err(_) => return invalid_identifier(raw_id),
    };

    match store.fetch(&id).await {
        Ok(Some(reader)) => {
            debug!(id = %id, size = reader.len(), "Serving blob");
            let len = reader.len();
            blob_response(id.as_str(), len, stream_body(reader, store.chunk_size()))
        }
        Ok(None) => text_response(StatusCode::NOT_FOUND, format!("Blob {} not found", id)),
        Err(e) => storage_failure("fetch", &e),
    }
}

/// HEAD /{id}
pub async fn handle_head(store: &BlobStore, raw_id: &str) -> Response<ResponseBody> {
    let id = match store.parse_id(raw_id) {
        Ok(id) => id,
        Err(_) => return invalid_identifier(raw_id),
    };

    match store.fetch(&id).await {
        Ok(Some(reader)) => blob_response(id.as_str(), reader.len(), empty_body()),
        Ok(None) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(empty_body())
            .unwrap(),
        Err(e) => storage_failure("head", &e),
    }
}

/// POST / - `content_length` is the declared payload size from the request headers
pub async fn handle_store<R>(
    store: &BlobStore,
    content_length: Option<u64>,
    body: R,
) -> Response<ResponseBody>
where
    R: AsyncRead + Unpin,
{
    let Some(declared_len) = content_length else {
        return text_response(StatusCode::LENGTH_REQUIRED, "Content-Length required");
    };

    match store.store(body, declared_len).await {
        Ok(StoreOutcome::Stored(id)) => text_response(StatusCode::OK, id.as_str()),
        Ok(StoreOutcome::AlreadyExists(id)) => {
            text_response(StatusCode::CONFLICT, format!("Blob {} already exists", id))
        }
        Err(e @ StorageError::ShortRead { .. }) => {
            warn!(error = %e, "Upload truncated");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
        }
        Err(e) => storage_failure("store", &e),
    }
}

/// DELETE /{id}
pub async fn handle_delete(store: &BlobStore, raw_id: &str) -> Response<ResponseBody> {
    let id = match store.parse_id(raw_id) {
        Ok(id) => id,
        Err(_) => return invalid_identifier(raw_id),
    };

    match store.delete(&id).await {
        Ok(DeleteOutcome::Deleted) => text_response(StatusCode::OK, format!("Deleted {}", id)),
        Ok(DeleteOutcome::NotFound) => {
            text_response(StatusCode::NOT_FOUND, format!("Blob {} not found", id))
        }
        Err(e) => storage_failure("delete", &e),
    }
}

/// GET /health
pub async fn handle_health(store: &BlobStore) -> Response<ResponseBody> {
    match store.stats().await {
        Ok(stats) => {
            let body = serde_json::json!({
                "status": "ok",
                "blobs": stats.total_blobs,
                "bytes": stats.total_bytes,
                "shards": stats.shard_dirs,
                "suppressed_cleanup_errors": stats.suppressed_cleanup_errors,
                "hash_algorithm": store.hash_algorithm().as_str(),
            });

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(full_body(body.to_string()))
                .unwrap()
        }
        Err(e) => storage_failure("stats", &e),
    }
}
