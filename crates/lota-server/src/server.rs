//! Relay server.
//!
//! This module wires the relay together:
//! - the accept loop, which hands sockets to the admission queue
//! - the worker pool, which dispatches queued connections
//! - the heartbeat
//! - the serial consumer, when a serial link is attached

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lota_core::{QueuedEvent, RelayConfig, ResourceStore, SerialDriver, SerialEventProcessor};

use crate::admission::{AdmissionQueue, AdmissionWorker, EnqueueError, PendingConnection};
use crate::dispatch::Dispatcher;
use crate::error::{RelayError, Result};
use crate::registry::SessionRegistry;
use crate::relay::{spawn_heartbeat, BroadcastRelay};
use crate::session::SessionHandler;
use crate::uart::spawn_serial_processor;

/// State shared by every relay component.
pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub relay: Arc<BroadcastRelay>,
    pub resources: Arc<dyn ResourceStore>,
    pub handler: Arc<dyn SessionHandler>,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        resources: Arc<dyn ResourceStore>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let relay = Arc::new(BroadcastRelay::new(registry.clone(), config.write_timeout()));
        Self {
            config,
            registry,
            relay,
            resources,
            handler,
        }
    }
}

/// The HTTP/WebSocket relay.
pub struct RelayServer {
    ctx: Arc<RelayContext>,
    listener: TcpListener,
}

impl RelayServer {
    /// Validate `config` and bind the listener.
    pub async fn bind(
        config: RelayConfig,
        resources: Arc<dyn ResourceStore>,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(RelayError::Listener)?;
        info!(target: "server", "LOTA relay listening on {}", listener.local_addr()?);

        Ok(Self {
            ctx: Arc::new(RelayContext::new(config, resources, handler)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.ctx.registry.clone()
    }

    pub fn relay(&self) -> Arc<BroadcastRelay> {
        self.ctx.relay.clone()
    }

    /// Start consuming serial events, broadcasting their data to sessions.
    ///
    /// Must be called from within the tokio runtime.
    pub fn attach_serial<D>(
        &self,
        processor: SerialEventProcessor<D>,
        events: mpsc::Receiver<QueuedEvent>,
    ) -> io::Result<std::thread::JoinHandle<()>>
    where
        D: SerialDriver + 'static,
    {
        spawn_serial_processor(processor, events, self.relay(), Handle::current())
    }

    /// Serve until the listener fails.
    ///
    /// Only returns on a fatal error; the caller is expected to restart.
    pub async fn run(self) -> Result<()> {
        let config = &self.ctx.config;
        let (queue, worker) = AdmissionQueue::new(config.queue_capacity, config.enqueue_timeout());

        for index in 0..config.worker_count {
            let worker = worker.clone();
            let dispatcher = Dispatcher::new(self.ctx.clone());
            tokio::spawn(run_worker(index, worker, dispatcher));
        }
        drop(worker);

        let heartbeat = spawn_heartbeat(self.relay(), config.heartbeat_period());
        info!(
            target: "server",
            "Serving with {} worker(s), queue capacity {}, max {} sessions",
            config.worker_count,
            config.queue_capacity,
            config.max_sessions
        );

        let result = accept_loop(&self.listener, &queue).await;
        heartbeat.abort();
        result
    }
}

async fn accept_loop(
    listener: &TcpListener,
    queue: &AdmissionQueue<PendingConnection>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(|e| {
            error!(target: "server", "Accept failed: {}", e);
            RelayError::Listener(e)
        })?;
        debug!(target: "server", "Accepted {}", peer);

        match queue.enqueue(PendingConnection::new(stream, peer)).await {
            Ok(()) => {}
            Err(EnqueueError::Timeout(conn)) => {
                warn!(
                    target: "server",
                    "Admission queue full, dropping {} after {:?}",
                    conn.peer,
                    queue.timeout()
                );
            }
            Err(EnqueueError::Closed(_)) => {
                error!(target: "server", "No workers left");
                return Err(RelayError::QueueClosed);
            }
        }
    }
}

async fn run_worker(
    index: usize,
    worker: AdmissionWorker<PendingConnection>,
    dispatcher: Dispatcher,
) {
    while let Some(conn) = worker.dequeue().await {
        let peer = conn.peer;
        let queued = conn.accepted_at.elapsed();

        match dispatcher.dispatch(conn).await {
            Ok(outcome) => debug!(
                target: "server",
                "worker {}: {} -> {:?} (queued {:?})", index, peer, outcome, queued
            ),
            Err(e) if e.is_connection_error() => {
                debug!(target: "server", "worker {}: {} closed: {}", index, peer, e)
            }
            Err(e) => error!(target: "server", "worker {}: {} failed: {}", index, peer, e),
        }
    }
    debug!(target: "server", "worker {} stopped", index);
}
