//! Protocol dispatcher.
//!
//! A worker hands every dequeued connection to [`Dispatcher::dispatch`],
//! which reads the request head under the read timeout and routes it:
//!
//! - `/` answers with the root document
//! - `/` with `Upgrade: websocket` completes the handshake and registers a
//!   session
//! - the other dashboard files answer with their bytes
//! - any other `GET` answers 404 with the error document
//! - anything else is closed without a response
//!
//! Only a promoted session outlives the call; every other connection is
//! closed when `dispatch` returns.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use lota_core::{Asset, Resource};
use lota_protocol::{classify, is_head_complete, response_head, RequestHead, Route, Status};

use crate::admission::PendingConnection;
use crate::error::{RelayError, Result};
use crate::registry::{RegistryFull, SessionId};
use crate::server::RelayContext;
use crate::session::spawn_reader;

const FALLBACK_NOT_FOUND: &[u8] = b"<html><body><h1>404 Not Found</h1></body></html>";
const SERVICE_UNAVAILABLE: &[u8] =
    b"<html><body><h1>503 Service Unavailable</h1><p>Too many sessions.</p></body></html>";

/// Query parameters logged from incoming requests.
const LOGGED_QUERY_PARAMS: [&str; 3] = ["query1", "query2", "query3"];

/// Stream that first yields bytes already read from `inner`.
///
/// The dispatcher reads the request head before it knows the route; the
/// WebSocket handshake then reads the same head again through this wrapper.
pub struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// How a connection left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A static response was sent and the connection closed.
    Served { status: Status, bytes: usize },
    /// The connection became a WebSocket session.
    Promoted(SessionId),
    /// An upgrade was refused because the registry is full.
    Rejected,
    /// The request was not understood; closed without a response.
    Closed,
}

/// Read into `buffer` until it holds a complete request head, reaches
/// `limit` bytes, the peer stops sending, or `timeout` elapses.
///
/// Fails when nothing at all was received.
pub async fn read_head<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    timeout: Duration,
    limit: usize,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; 512];

    while buffer.len() < limit && !is_head_complete(buffer) {
        let want = chunk.len().min(limit - buffer.len());
        match time::timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if buffer.is_empty() => return Err(RelayError::Timeout(timeout)),
            Err(_) => break,
        }
    }

    if buffer.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed before request").into());
    }
    Ok(())
}

/// Send a complete response and close the write side, within `timeout`.
pub async fn write_response<S>(
    stream: &mut S,
    status: Status,
    resource: &Resource,
    timeout: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let head = response_head(status, resource.content_type, resource.len());
    let send = async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&resource.body).await?;
        stream.shutdown().await
    };
    time::timeout(timeout, send)
        .await
        .map_err(|_| RelayError::Timeout(timeout))??;
    Ok(resource.len())
}

fn log_request(head: &RequestHead, peer: SocketAddr) {
    debug!(target: "dispatch", "{} {:?} {}", peer, head.method, head.target);
    if let Some(host) = head.header("Host") {
        info!(target: "dispatch", "Found header => Host: {}", host);
    }
    for key in LOGGED_QUERY_PARAMS {
        if let Some(value) = head.query_param(key) {
            info!(target: "dispatch", "Found URL query parameter => {}={}", key, value);
        }
    }
}

/// Routes accepted connections.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<RelayContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self { ctx }
    }

    /// Classify `conn` and serve or promote it.
    pub async fn dispatch(&self, mut conn: PendingConnection) -> Result<DispatchOutcome> {
        let config = &self.ctx.config;
        read_head(
            &mut conn.stream,
            &mut conn.buffer,
            config.read_timeout(),
            config.max_request_head,
        )
        .await?;

        let head = match RequestHead::parse(&conn.buffer) {
            Ok(head) => head,
            Err(e) => {
                debug!(target: "dispatch", "{} unparseable request: {}", conn.peer, e);
                return Ok(DispatchOutcome::Closed);
            }
        };
        log_request(&head, conn.peer);

        match classify(&head) {
            Route::StaticRoot => self.serve(&mut conn.stream, Asset::Index).await,
            Route::StaticAsset(asset) => self.serve(&mut conn.stream, asset).await,
            Route::NotFound => self.not_found(&mut conn.stream).await,
            Route::Upgrade => self.promote(conn).await,
            Route::Unknown => {
                debug!(target: "dispatch", "{} unsupported request, closing", conn.peer);
                Ok(DispatchOutcome::Closed)
            }
        }
    }

    async fn serve(&self, stream: &mut TcpStream, asset: Asset) -> Result<DispatchOutcome> {
        match self.ctx.resources.asset(asset) {
            Some(resource) => self.send(stream, Status::Ok, &resource).await,
            None => {
                warn!(target: "dispatch", "{} missing from resource store", asset.file_name());
                self.not_found(stream).await
            }
        }
    }

    async fn not_found(&self, stream: &mut TcpStream) -> Result<DispatchOutcome> {
        let page = self
            .ctx
            .resources
            .asset(Asset::ErrorPage)
            .unwrap_or_else(|| Resource {
                content_type: "text/html",
                body: Cow::Borrowed(FALLBACK_NOT_FOUND),
            });
        self.send(stream, Status::NotFound, &page).await
    }

    async fn send(
        &self,
        stream: &mut TcpStream,
        status: Status,
        resource: &Resource,
    ) -> Result<DispatchOutcome> {
        let bytes = write_response(stream, status, resource, self.ctx.config.write_timeout()).await?;
        Ok(DispatchOutcome::Served { status, bytes })
    }

    async fn promote(&self, conn: PendingConnection) -> Result<DispatchOutcome> {
        let PendingConnection {
            mut stream,
            peer,
            buffer,
            ..
        } = conn;
        let registry = &self.ctx.registry;
        let config = &self.ctx.config;

        if registry.is_full().await {
            warn!(
                target: "dispatch",
                "{} upgrade refused: {} sessions open", peer, registry.max_sessions()
            );
            let page = Resource {
                content_type: "text/html",
                body: Cow::Borrowed(SERVICE_UNAVAILABLE),
            };
            write_response(&mut stream, Status::ServiceUnavailable, &page, config.write_timeout())
                .await?;
            return Ok(DispatchOutcome::Rejected);
        }

        let handshake = tokio_tungstenite::accept_async(Rewind::new(buffer, stream));
        let ws_stream = time::timeout(config.read_timeout(), handshake)
            .await
            .map_err(|_| RelayError::Timeout(config.read_timeout()))??;

        let id = self.register(ws_stream, peer).await?;
        Ok(DispatchOutcome::Promoted(id))
    }

    /// Register an upgraded stream as a session and start its reader.
    ///
    /// If the registry filled up after the upgrade was accepted, the client
    /// gets a close frame with code 1013 instead.
    pub async fn register(
        &self,
        ws_stream: WebSocketStream<Rewind<TcpStream>>,
        peer: SocketAddr,
    ) -> Result<SessionId> {
        let registry = &self.ctx.registry;
        let config = &self.ctx.config;
        let (sink, source) = ws_stream.split();

        match registry.add(sink, Some(peer)).await {
            Ok(id) => {
                let reader = spawn_reader(id, source, registry.clone(), self.ctx.handler.clone());
                registry.attach_reader(id, reader.abort_handle()).await;
                info!(target: "dispatch", "{} upgraded to {}", peer, id);
                Ok(id)
            }
            Err(RegistryFull(mut sink)) => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: "session limit reached".into(),
                }));
                if time::timeout(config.write_timeout(), sink.send(close)).await.is_err() {
                    debug!(target: "dispatch", "{} close frame timed out", peer);
                }
                Err(RelayError::SessionLimit(registry.max_sessions()))
            }
        }
    }
}
