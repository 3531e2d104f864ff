use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http::{Method, StatusCode};
use httpdisk_device::DeviceAccessor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::request;
use crate::http::response::Response;
use crate::service::DiskService;

/// Pause before rebuilding the server after the serve loop fails.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Time allowed for one connection from accept to the last response byte.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds on discarding unread request bytes after the response is sent.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_DRAIN_BYTES: usize = 256 * 1024;

pub struct RunningDiskServer {
    addr: SocketAddr,
    capacity: u64,
    shutdown: CancellationToken,
    join: Option<JoinHandle<io::Result<()>>>,
}

impl RunningDiskServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            join.await.context("disk server task panicked")??;
        }
        Ok(())
    }
}

impl Drop for RunningDiskServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Open the disk, bind, and serve in a background task. Unlike [`run`], failures are returned
/// to the caller instead of being retried.
pub async fn start(config: &ServerConfig) -> anyhow::Result<RunningDiskServer> {
    let service = open_service(config).await?;
    let capacity = service.capacity();
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    let addr = listener.local_addr().context("read bound address")?;

    let shutdown = CancellationToken::new();
    let join = tokio::spawn(serve(listener, Arc::new(service), shutdown.clone()));

    Ok(RunningDiskServer {
        addr,
        capacity,
        shutdown,
        join: Some(join),
    })
}

/// Serve until `shutdown` is cancelled. Any failure of the serve loop is logged and the server is
/// rebuilt after [`RESTART_DELAY`], indefinitely. The disk capacity is read once, on the first
/// successful start.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut service: Option<Arc<DiskService>> = None;

    loop {
        let res = async {
            let svc = match &service {
                Some(svc) => Arc::clone(svc),
                None => {
                    let svc = Arc::new(open_service(&config).await?);
                    tracing::info!(
                        disk = %svc.path().display(),
                        capacity = svc.capacity(),
                        "disk opened"
                    );
                    service = Some(Arc::clone(&svc));
                    svc
                }
            };
            let listener = TcpListener::bind(config.bind_addr)
                .await
                .with_context(|| format!("bind {}", config.bind_addr))?;
            tracing::info!("httpdisk-server listening on http://{}", config.bind_addr);
            serve(listener, svc, shutdown.clone())
                .await
                .context("serve loop")
        }
        .await;

        match res {
            Ok(()) => return Ok(()),
            Err(err) => tracing::error!("disk server failed, restarting: {err:?}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}

async fn open_service(config: &ServerConfig) -> anyhow::Result<DiskService> {
    let disk = config.disk.clone();
    tokio::task::spawn_blocking(move || DiskService::open(disk, DeviceAccessor::default()))
        .await
        .context("disk open task panicked")?
        .with_context(|| format!("open disk {}", config.disk.display()))
}

/// Accept and handle connections one at a time until `shutdown` is cancelled.
///
/// Requests never overlap, so device access needs no locking. Returns an error when accepting
/// fails or a connection handler panics.
pub async fn serve(
    listener: TcpListener,
    service: Arc<DiskService>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let span = tracing::info_span!(
            "http_request",
            peer = %peer,
            method = tracing::field::Empty,
            target = tracing::field::Empty,
        );
        // Each connection runs in its own task so a panic surfaces here instead of unwinding
        // through the accept loop. The task is awaited before the next accept.
        let handler = tokio::spawn(
            tokio::time::timeout(
                CONNECTION_TIMEOUT,
                handle_connection(Arc::clone(&service), stream),
            )
            .instrument(span.clone()),
        );
        if join_handler(handler).await?.is_err() {
            tracing::warn!(parent: &span, "connection timed out");
        }
    }
}

/// Wait for a connection task. A task that panicked or was cancelled fails the serve loop.
async fn join_handler<T>(handler: JoinHandle<T>) -> io::Result<T> {
    handler.await.map_err(|err| {
        let what = if err.is_panic() { "panicked" } else { "was cancelled" };
        io::Error::new(io::ErrorKind::Other, format!("connection handler {what}"))
    })
}

async fn handle_connection(service: Arc<DiskService>, stream: TcpStream) {
    let mut conn = BufReader::new(stream);

    let head = match request::read_head(&mut conn).await {
        Ok(head) => head,
        Err(err) => {
            match err.status() {
                Some(status) => {
                    tracing::warn!("bad request: {err}");
                    finish(conn, Response::text(status, err.to_string()), false).await;
                }
                None => tracing::debug!("no request read: {err}"),
            }
            return;
        }
    };

    let span = tracing::Span::current();
    span.record("method", tracing::field::display(&head.method));
    span.record("target", tracing::field::display(&head.target));

    let response = match head.method {
        Method::HEAD => service.head(),
        Method::GET => service.get(&head.headers).await,
        Method::PUT => service.put(&head.headers, &mut conn).await,
        _ => Response::text(StatusCode::NOT_IMPLEMENTED, "unsupported method"),
    };

    tracing::info!(
        status = response.status.as_u16(),
        bytes_sent = if head.method == Method::HEAD { 0 } else { response.body.len() },
        "request complete"
    );
    finish(conn, response, head.method == Method::HEAD).await;
}

/// Write `response` and close the connection. A peer that went away first is not an error.
async fn finish(conn: BufReader<TcpStream>, response: Response, head_only: bool) {
    let mut stream = conn.into_inner();
    if let Err(err) = response.write_to(&mut stream, head_only).await {
        if is_disconnect(&err) {
            tracing::debug!("peer closed connection early: {err}");
        } else {
            tracing::warn!("failed to write response: {err}");
        }
    }
    if let Err(err) = stream.shutdown().await {
        if !is_disconnect(&err) {
            tracing::debug!("failed to shut down connection: {err}");
        }
    }

    // Closing with unread input makes the kernel reset the connection, which can discard the
    // response before the client reads it.
    let drain = async {
        let mut buf = [0u8; 8192];
        let mut total = 0;
        while total < MAX_DRAIN_BYTES {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
