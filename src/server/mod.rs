//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.
//!
//! The accept loop only accepts and spawns. At most `max_connections`
//! connections are served at once; when all permits are taken the loop stops
//! accepting until one frees up. A connection that stays silent for
//! `idle_timeout` is closed so idle keep-alive sockets cannot hold every
//! slot. On shutdown the loop stops accepting, gives
//! open connections a grace period to finish, then aborts the rest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

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

/// Maximum size of a complete HTTP request we will buffer before rejecting it (1 MiB).
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use sheetcache::server::Server;
/// use sheetcache::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:5050").await?;
///     server
///         .run_until(
///             |_req: Request| async { Response::text(StatusCode::Ok, "hello") },
///             async {
///                 let _ = tokio::signal::ctrl_c().await;
///             },
///         )
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    limiter: Arc<Semaphore>,
    shutdown_grace: Duration,
    idle_timeout: Duration,
}

impl Server {
    /// Binds the server to the given TCP address with default limits.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        Self::bind_with(addr, &ServerConfig::default()).await
    }

    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind_with(addr: impl AsRef<str>, config: &ServerConfig) -> Result<Self, ServerError> {
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
            limiter: Arc::new(Semaphore::new(config.max_connections.max(1))),
            shutdown_grace: config.shutdown_grace,
            idle_timeout: config.idle_timeout,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and dispatches requests to `handler` until
    /// `shutdown` resolves.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// Accept errors are logged and do not stop the loop. Once `shutdown`
    /// resolves no new connections are accepted; open connections get the
    /// configured grace period before they are aborted.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the `Result` leaves room for listener
    /// failures that cannot be recovered from.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        info!(address = %self.local_addr, "sheetcache listening");

        loop {
            let permit = tokio::select! {
                biased;
                () = &mut shutdown => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                biased;
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let idle_timeout = self.idle_timeout;

            workers.spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(stream, peer_addr, idle_timeout, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });

            while let Some(finished) = workers.try_join_next() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "connection handler panicked");
                    }
                }
            }
        }

        info!(open = workers.len(), "shutting down, no longer accepting connections");
        drop(self.listener);
        drain(workers, self.shutdown_grace).await;
        info!("server stopped");
        Ok(())
    }
}

/// Waits up to `grace` for the remaining connection tasks, then aborts them.
async fn drain(mut workers: JoinSet<()>, grace: Duration) {
    let finished = tokio::time::timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            remaining = workers.len(),
            "grace period elapsed, aborting open connections"
        );
        workers.shutdown().await;
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`, or stays silent for `idle_timeout`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    idle_timeout: Duration,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let Ok(read) = tokio::time::timeout(idle_timeout, stream.read_buf(&mut buf)).await else {
            debug!(peer = %peer_addr, ?idle_timeout, "idle connection timed out");
            break;
        };
        let bytes_read = read?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Pipelined requests may already be buffered; serve all of them
        // before reading again.
        loop {
            if buf.len() > MAX_REQUEST_SIZE {
                warn!(peer = %peer_addr, "request too large, sending 413");
                let response = Response::text(StatusCode::PayloadTooLarge, "Request entity too large")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                return Ok(());
            }

            let (request, frame_len) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => break,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                    let response = Response::new(StatusCode::BadRequest)
                        .content_type(crate::http::TEXT_PLAIN)
                        .body(format!("Bad Request: {e}"))
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    return Ok(());
                }
            };

            let keep_alive = request.is_keep_alive();

            debug!(
                peer = %peer_addr,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let response = handler(request).await.keep_alive(keep_alive);
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            let _ = buf.split_to(frame_len);

            if !keep_alive {
                debug!(peer = %peer_addr, "Connection: close, shutting down");
                return Ok(());
            }

            if buf.is_empty() {
                break;
            }
        }
    }

    Ok(())
}
