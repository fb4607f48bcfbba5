//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a [`Handler`].
//! Every request gets a fresh [`WireWriter`]; whatever the handler pipeline
//! writes into it is flushed to the socket once the handler returns.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::http::{Method, Request, RequestError, Response, StatusCode, WireWriter};
use crate::middleware::Handler;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The hamster HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use hamster::files::ServeDir;
/// use hamster::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(ServeDir::new("static")).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `handler` until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H: Handler>(self, handler: H) -> Result<(), ServerError> {
        self.run_until(handler, std::future::pending()).await
    }

    /// Serves `handler` until `shutdown` resolves, then stops accepting,
    /// lets in-flight requests finish, closes idle keep-alive connections,
    /// and returns once every connection task has ended.
    pub async fn run_until<H, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Handler,
        S: Future<Output = ()>,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        info!(address = %self.local_addr, "hamster listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining connections");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    debug!(peer = %peer_addr, "connection accepted");
                    let handler = Arc::clone(&handler);
                    let stop = stop_rx.clone();

                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, handler, stop).await {
                            warn!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Receivers see the flag even if the sender is gone by the time they look.
        let _ = stop_tx.send(true);
        while tasks.join_next().await.is_some() {}

        info!("hamster stopped");
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or the server begins shutting down.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn Handler>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    // Pipelined requests may already be buffered; only touch the socket when
    // the buffer is empty or holds a partial request.
    let mut need_more = true;

    loop {
        if buf.is_empty() || need_more {
            let bytes_read = if buf.is_empty() {
                // Between requests: an idle connection must not hold up shutdown.
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    read = stream.read_buf(&mut buf) => read?,
                    _ = stop.changed() => {
                        debug!(peer = %peer_addr, "closing idle connection for shutdown");
                        break;
                    }
                }
            } else {
                stream.read_buf(&mut buf).await?
            };

            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }
        need_more = false;

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response =
                Response::new(StatusCode::PayloadTooLarge).body("Request entity too large");
            stream.write_all(&response.into_bytes(false)).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                need_more = true;
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response =
                    Response::new(StatusCode::BadRequest).body(format!("Bad Request: {e}"));
                stream.write_all(&response.into_bytes(false)).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let total_needed = body_offset + request.content_length().unwrap_or(0);
        if buf.len() < total_needed {
            need_more = true;
            continue;
        }

        let keep_alive = request.is_keep_alive() && !*stop.borrow();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let head_only = *request.method() == Method::Head;
        let mut wire = WireWriter::new(keep_alive).head_only(head_only);
        handler.serve(request, &mut wire).await;
        stream.write_all(&wire.finish()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}
