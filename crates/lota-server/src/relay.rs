//! Broadcast relay and heartbeat.
//!
//! The relay fans one frame out to every open session. Writes run
//! concurrently and outside the registry lock, each bounded by the write
//! timeout; a session whose write fails or stalls is marked closing, and the
//! others still receive the frame. Closing sessions are reaped at the start
//! of the next broadcast.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::{Sink, SinkExt};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use lota_protocol::{encode_heartbeat, Frame, FrameKind};

use crate::registry::{SessionRegistry, WsSink};

/// WebSocket message carrying `frame`. Lifecycle frames have none.
pub fn frame_to_message(frame: &Frame) -> Option<Message> {
    match frame.kind {
        FrameKind::Text => Some(Message::Text(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
        FrameKind::Binary => Some(Message::Binary(frame.payload.clone())),
        FrameKind::Ping => Some(Message::Ping(frame.payload.clone())),
        FrameKind::Pong => Some(Message::Pong(frame.payload.clone())),
        FrameKind::Connect | FrameKind::Disconnect(_) => None,
    }
}

/// Fan-out writer over the session registry.
pub struct BroadcastRelay<S = WsSink> {
    registry: Arc<SessionRegistry<S>>,
    write_timeout: Duration,
}

impl<S> BroadcastRelay<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(registry: Arc<SessionRegistry<S>>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<S>> {
        &self.registry
    }

    /// Send `frame` to every open session.
    ///
    /// Returns the number of sessions the frame was written to.
    pub async fn broadcast(&self, frame: &Frame) -> usize {
        let Some(message) = frame_to_message(frame) else {
            return 0;
        };

        self.registry.reap().await;

        let write_timeout = self.write_timeout;
        let writes = self.registry.open_sinks().await.into_iter().map(|(id, sink)| {
            let message = message.clone();
            async move {
                let write = async {
                    let mut sink = sink.lock().await;
                    sink.send(message).await
                };
                (id, time::timeout(write_timeout, write).await)
            }
        });

        let mut delivered = 0;
        for (id, result) in join_all(writes).await {
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(target: "relay", "Write to {} failed: {}", id, e);
                    self.registry.mark_closing(id).await;
                }
                Err(_) => {
                    warn!(
                        target: "relay",
                        "Write to {} timed out after {:?}", id, write_timeout
                    );
                    self.registry.mark_closing(id).await;
                }
            }
        }
        delivered
    }
}

/// Heartbeat counter. Wraps from 255 to 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatCounter(u8);

impl HeartbeatCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u8) -> Self {
        Self(value)
    }

    /// Current value; advances the counter.
    pub fn next(&mut self) -> u8 {
        let value = self.0;
        self.0 = self.0.wrapping_add(1);
        value
    }
}

/// Broadcast the heartbeat counter every `period`, starting at once.
pub fn spawn_heartbeat<S>(relay: Arc<BroadcastRelay<S>>, period: Duration) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut counter = HeartbeatCounter::new();

        loop {
            ticker.tick().await;
            let count = counter.next();
            let delivered = relay.broadcast(&encode_heartbeat(count)).await;
            debug!(target: "heartbeat", "Tick {} sent to {} session(s)", count, delivered);
        }
    })
}
