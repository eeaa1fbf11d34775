//! Session reader and application events.
//!
//! Once a connection is promoted, a reader task drains its inbound half and
//! reports each message to a [`SessionHandler`]. When the client goes away
//! the reader marks the session closing; the next broadcast reaps it. A
//! reader aborted by the registry still reports a disconnect.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use lota_protocol::{decode_client_command, ClientCommand, DisconnectReason, FrameKind};

use crate::registry::{SessionId, SessionRegistry};

/// Something that happened on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    /// The client sent a close frame.
    DisconnectExternal,
    /// The stream ended without a close frame.
    DisconnectInternal,
    /// Reading failed.
    DisconnectError(String),
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl SessionEvent {
    pub fn frame_kind(&self) -> FrameKind {
        match self {
            SessionEvent::Connect => FrameKind::Connect,
            SessionEvent::DisconnectExternal => FrameKind::Disconnect(DisconnectReason::External),
            SessionEvent::DisconnectInternal => FrameKind::Disconnect(DisconnectReason::Internal),
            SessionEvent::DisconnectError(_) => FrameKind::Disconnect(DisconnectReason::Error),
            SessionEvent::Text(_) => FrameKind::Text,
            SessionEvent::Binary(_) => FrameKind::Binary,
            SessionEvent::Ping(_) => FrameKind::Ping,
            SessionEvent::Pong(_) => FrameKind::Pong,
        }
    }
}

/// Receiver of session events.
pub trait SessionHandler: Send + Sync {
    fn on_event(&self, id: SessionId, event: &SessionEvent);
}

/// Logs every event and decodes client commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl SessionHandler for LoggingHandler {
    fn on_event(&self, id: SessionId, event: &SessionEvent) {
        match event {
            SessionEvent::Connect => info!(target: "ws_server", "{} connected", id),
            SessionEvent::DisconnectExternal => {
                info!(target: "ws_server", "{} closed by client", id)
            }
            SessionEvent::DisconnectInternal => info!(target: "ws_server", "{} disconnected", id),
            SessionEvent::DisconnectError(e) => {
                warn!(target: "ws_server", "{} read error: {}", id, e)
            }
            SessionEvent::Text(text) => match decode_client_command(text) {
                Ok(ClientCommand::Odometry(odometry)) => {
                    info!(target: "ws_server", "{} odometry {}", id, odometry)
                }
                Ok(ClientCommand::Log(message)) => {
                    info!(target: "ws_server", "{} log: {}", id, message)
                }
                Ok(ClientCommand::Unrecognized { tag, len }) => warn!(
                    target: "ws_server",
                    "{} unrecognized command {:?} ({} bytes)",
                    id,
                    char::from(tag),
                    len
                ),
                Err(e) => warn!(target: "ws_server", "{} bad command: {}", id, e),
            },
            SessionEvent::Binary(data) => {
                debug!(target: "ws_server", "{} binary frame, {} bytes", id, data.len())
            }
            SessionEvent::Ping(_) => debug!(target: "ws_server", "{} ping", id),
            SessionEvent::Pong(_) => debug!(target: "ws_server", "{} pong", id),
        }
    }
}

/// Drain `stream` until the client disconnects, reporting every message.
pub async fn read_session<St>(id: SessionId, mut stream: St, handler: &dyn SessionHandler) -> DisconnectReason
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let event = match message {
            Ok(Message::Text(text)) => SessionEvent::Text(text),
            Ok(Message::Binary(data)) => SessionEvent::Binary(data),
            Ok(Message::Ping(data)) => SessionEvent::Ping(data),
            Ok(Message::Pong(data)) => SessionEvent::Pong(data),
            Ok(Message::Close(_)) => {
                handler.on_event(id, &SessionEvent::DisconnectExternal);
                return DisconnectReason::External;
            }
            Ok(Message::Frame(_)) => continue,
            Err(e) => {
                handler.on_event(id, &SessionEvent::DisconnectError(e.to_string()));
                return DisconnectReason::Error;
            }
        };
        handler.on_event(id, &event);
    }

    handler.on_event(id, &SessionEvent::DisconnectInternal);
    DisconnectReason::Internal
}

/// Reports an internal disconnect when a reader is dropped before its
/// stream ended.
struct DisconnectGuard {
    id: SessionId,
    handler: Arc<dyn SessionHandler>,
    reported: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.reported {
            debug!(target: "ws_server", "{} reader aborted", self.id);
            self.handler.on_event(self.id, &SessionEvent::DisconnectInternal);
        }
    }
}

/// Spawn the reader task of a freshly registered session.
pub fn spawn_reader<St, S>(
    id: SessionId,
    stream: St,
    registry: Arc<SessionRegistry<S>>,
    handler: Arc<dyn SessionHandler>,
) -> JoinHandle<()>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    S: Send + 'static,
{
    tokio::spawn(async move {
        let mut guard = DisconnectGuard {
            id,
            handler,
            reported: false,
        };
        guard.handler.on_event(id, &SessionEvent::Connect);
        let reason = read_session(id, stream, guard.handler.as_ref()).await;
        guard.reported = true;
        registry.mark_closing(id).await;
        debug!(target: "ws_server", "{} reader finished: {:?}", id, reason);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    use crate::registry::SessionState;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<SessionEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SessionHandler for RecordingHandler {
        fn on_event(&self, _id: SessionId, event: &SessionEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_reader_reports_messages_until_close() {
        let handler = RecordingHandler::default();
        let messages = stream::iter(vec![
            Ok(Message::Text("O123".to_string())),
            Ok(Message::Ping(vec![1])),
            Ok(Message::Binary(vec![9, 9])),
            Ok(Message::Close(None)),
            Ok(Message::Text("after close".to_string())),
        ]);

        let reason = read_session(SessionId(1), messages, &handler).await;

        assert_eq!(reason, DisconnectReason::External);
        assert_eq!(
            handler.events(),
            vec![
                SessionEvent::Text("O123".to_string()),
                SessionEvent::Ping(vec![1]),
                SessionEvent::Binary(vec![9, 9]),
                SessionEvent::DisconnectExternal,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_end_is_internal_disconnect() {
        let handler = RecordingHandler::default();
        let messages = stream::iter(Vec::<Result<Message, tungstenite::Error>>::new());

        let reason = read_session(SessionId(1), messages, &handler).await;

        assert_eq!(reason, DisconnectReason::Internal);
        assert_eq!(handler.events(), vec![SessionEvent::DisconnectInternal]);
    }

    #[tokio::test]
    async fn test_read_error_is_error_disconnect() {
        let handler = RecordingHandler::default();
        let messages = stream::iter(vec![Err(tungstenite::Error::ConnectionClosed)]);

        let reason = read_session(SessionId(1), messages, &handler).await;

        assert_eq!(reason, DisconnectReason::Error);
        assert!(matches!(
            handler.events().as_slice(),
            [SessionEvent::DisconnectError(_)]
        ));
    }

    #[tokio::test]
    async fn test_spawned_reader_marks_session_closing() {
        let registry = Arc::new(SessionRegistry::new(10));
        let id = registry.add((), None).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let messages = stream::iter(vec![Ok(Message::Text("Lhello".to_string()))]);

        spawn_reader(id, messages, registry.clone(), handler.clone())
            .await
            .unwrap();

        assert_eq!(registry.state(id).await, Some(SessionState::Closing));
        assert_eq!(
            handler.events(),
            vec![
                SessionEvent::Connect,
                SessionEvent::Text("Lhello".to_string()),
                SessionEvent::DisconnectInternal,
            ]
        );
    }

    #[tokio::test]
    async fn test_evicted_reader_reports_disconnect() {
        let registry = Arc::new(SessionRegistry::new(10));
        let id = registry.add((), None).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let messages = stream::pending::<Result<Message, tungstenite::Error>>();

        let reader = spawn_reader(id, messages, registry.clone(), handler.clone());
        registry.attach_reader(id, reader.abort_handle()).await;
        while handler.events().is_empty() {
            tokio::task::yield_now().await;
        }

        registry.mark_closing(id).await;
        registry.reap().await;

        assert!(reader.await.unwrap_err().is_cancelled());
        assert_eq!(
            handler.events(),
            vec![SessionEvent::Connect, SessionEvent::DisconnectInternal]
        );
    }

    #[test]
    fn test_logging_handler_accepts_every_event() {
        let handler = LoggingHandler;
        for event in [
            SessionEvent::Connect,
            SessionEvent::Text("O12".to_string()),
            SessionEvent::Text("Lmsg".to_string()),
            SessionEvent::Text("?".to_string()),
            SessionEvent::Text(String::new()),
            SessionEvent::Binary(vec![1]),
            SessionEvent::DisconnectError("reset".to_string()),
        ] {
            handler.on_event(SessionId(1), &event);
        }
        assert_eq!(
            SessionEvent::DisconnectExternal.frame_kind(),
            FrameKind::Disconnect(DisconnectReason::External)
        );
    }
}
