//! HTTP API for blob storage
//!
//! - `POST /` - Store the request body, respond with its identifier
//! - `GET /{id}` - Download a blob
//! - `HEAD /{id}` - Check if a blob exists and get its size
//! - `DELETE /{id}` - Delete a blob
//! - `GET /health` - Storage statistics
//!
//! ## Example Usage
//!
//! ```bash
//! # Store a file
//! curl --data-binary @video.mp4 http://localhost:8080/
//!
//! # Retrieve it
//! curl -OJ http://localhost:8080/<id>
//!
//! # Delete it
//! curl -X DELETE http://localhost:8080/<id>
//! ```

use crate::blob_store::BlobStore;
use crate::error::StorageError;
use crate::handlers::{self, ResponseBody};
use futures_util::{future, stream, Stream, StreamExt, TryStreamExt};
use http_body_util::BodyStream;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Pause after a failed accept, so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Endless stream of accepted connections
fn accept_stream(listener: TcpListener) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>> {
    stream::unfold(listener, |listener| async move {
        let next = listener.accept().await;
        Some((next, listener))
    })
}

/// HTTP server state
pub struct HttpServer {
    blob_store: Arc<BlobStore>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(blob_store: Arc<BlobStore>) -> Self {
        Self { blob_store }
    }

    /// Accept connections on an already bound listener
    ///
    /// Each connection is served on its own task, so slow uploads never hold
    /// up other clients. Accept errors (fd exhaustion, aborted handshakes) are
    /// logged and retried after a short pause; the loop only ends with the
    /// process.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), StorageError> {
        info!(addr = %listener.local_addr()?, "HTTP server listening");

        self.serve_incoming(accept_stream(listener)).await;
        Ok(())
    }

    async fn serve_incoming<S>(self: Arc<Self>, connections: S)
    where
        S: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
    {
        tokio::pin!(connections);

        while let Some(next) = connections.next().await {
            let (stream, remote_addr) = match next {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let store = self.blob_store.as_ref();
        let id = path.strip_prefix('/').unwrap_or(&path);

        let response = match (method, path.as_str()) {
            (Method::GET, "/health") => handlers::handle_health(store).await,
            (Method::POST, "/") => self.handle_upload(req).await,
            (Method::GET, _) => handlers::handle_fetch(store, id).await,
            (Method::HEAD, _) => handlers::handle_head(store, id).await,
            (Method::DELETE, _) => handlers::handle_delete(store, id).await,
            _ => Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(header::ALLOW, "GET, HEAD, POST, DELETE")
                .body(handlers::empty_body())
                .unwrap(),
        };

        Ok(response)
    }

    /// POST / - adapt the request body into a byte reader for the store
    async fn handle_upload(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let content_length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        // A body that errors out (client gone mid-upload) surfaces as a read
        // error; an early EOF surfaces as a short read inside the store.
        let stream = BodyStream::new(req.into_body())
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
            .map_err(|e| io::Error::new(io::ErrorKind::UnexpectedEof, e));
        let reader = StreamReader::new(stream);
        tokio::pin!(reader);

        handlers::handle_store(&self.blob_store, content_length, reader).await
    }
}
