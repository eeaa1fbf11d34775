//! Session registry.
//!
//! The registry is the single source of truth for which WebSocket sessions
//! are live. The table sits behind one async mutex that is only held for
//! bookkeeping; each session's sink has its own lock so writes happen
//! outside the table lock. Sessions that fail are marked
//! [`SessionState::Closing`] in place and removed by the next [`reap`].
//! Closing sessions do not count against the session limit.
//!
//! [`reap`]: SessionRegistry::reap

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::dispatch::Rewind;

/// Outbound half of an upgraded connection.
pub type WsSink = SplitSink<WebSocketStream<Rewind<TcpStream>>, Message>;

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// A disconnect was observed; removed on the next reap.
    Closing,
    Closed,
}

/// Outbound half of a session, shared with in-flight broadcasts.
pub type SharedSink<S> = Arc<Mutex<S>>;

/// A live upgraded connection.
pub struct Session<S> {
    pub id: SessionId,
    pub sink: SharedSink<S>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub peer: Option<SocketAddr>,
    reader: Option<AbortHandle>,
}

impl<S> Session<S> {
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            peer: self.peer,
        }
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub peer: Option<SocketAddr>,
}

/// Rejected add. The sink is handed back so the caller can close it.
#[derive(Debug)]
pub struct RegistryFull<S>(pub S);

/// Set of live sessions.
pub struct SessionRegistry<S = WsSink> {
    sessions: Mutex<BTreeMap<SessionId, Session<S>>>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl<S> SessionRegistry<S> {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Register a freshly upgraded session.
    pub async fn add(&self, sink: S, peer: Option<SocketAddr>) -> Result<SessionId, RegistryFull<S>> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            reap_locked(&mut *sessions);
        }
        if sessions.len() >= self.max_sessions {
            return Err(RegistryFull(sink));
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        sessions.insert(
            id,
            Session {
                id,
                sink: Arc::new(Mutex::new(sink)),
                state: SessionState::Open,
                created_at: Utc::now(),
                peer,
                reader: None,
            },
        );
        debug!(target: "registry", "Added {} ({} live)", id, sessions.len());
        Ok(id)
    }

    /// Remove a session. Removing an unknown id is a no-op.
    ///
    /// Returns whether a session was removed.
    pub async fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().await.remove(&id);
        match removed {
            Some(mut session) => {
                session.close();
                debug!(target: "registry", "Removed {}", id);
                true
            }
            None => false,
        }
    }

    /// Flag an open session for removal on the next reap.
    ///
    /// Returns whether the session was open.
    pub async fn mark_closing(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(session) if session.is_open() => {
                session.state = SessionState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Remove every session that is no longer open.
    pub async fn reap(&self) -> Vec<SessionId> {
        reap_locked(&mut *self.sessions.lock().await)
    }

    /// Tie a session's reader task to its lifetime. The task is aborted when
    /// the session is removed, or at once if it is already gone.
    pub async fn attach_reader(&self, id: SessionId, reader: AbortHandle) {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(session) => session.reader = Some(reader),
            None => reader.abort(),
        }
    }

    /// Sinks of every open session, for writing without the table lock.
    pub async fn open_sinks(&self) -> Vec<(SessionId, SharedSink<S>)> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|session| session.is_open())
            .map(|session| (session.id, session.sink.clone()))
            .collect()
    }

    /// Visit every session under the registry lock.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Session<S>),
    {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            f(session);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Whether another session would be refused. Closing sessions are
    /// about to be reaped and leave room.
    pub async fn is_full(&self) -> bool {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|session| session.is_open()).count() >= self.max_sessions
    }

    pub async fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.lock().await.get(&id).map(|session| session.state)
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.lock().await.values().map(Session::info).collect()
    }
}

fn reap_locked<S>(sessions: &mut BTreeMap<SessionId, Session<S>>) -> Vec<SessionId> {
    let stale: Vec<SessionId> = sessions
        .values()
        .filter(|session| !session.is_open())
        .map(|session| session.id)
        .collect();

    for id in &stale {
        if let Some(mut session) = sessions.remove(id) {
            session.close();
        }
    }
    if !stale.is_empty() {
        debug!(target: "registry", "Reaped {} session(s), {} live", stale.len(), sessions.len());
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = SessionRegistry::new(10);

        let a = registry.add((), None).await.unwrap();
        let b = registry.add((), None).await.unwrap();
        registry.remove(a).await;
        let c = registry.add((), None).await.unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(a.to_string(), "session-1");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new(10);
        let id = registry.add((), None).await.unwrap();

        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);
        assert!(!registry.remove(SessionId(999)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_registry_hands_sink_back() {
        let registry = SessionRegistry::new(2);
        registry.add(1u32, None).await.unwrap();
        registry.add(2u32, None).await.unwrap();
        assert!(registry.is_full().await);

        let RegistryFull(sink) = registry.add(3u32, None).await.unwrap_err();
        assert_eq!(sink, 3);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_closing_session_leaves_room() {
        let registry = SessionRegistry::new(1);
        let old = registry.add(1u32, None).await.unwrap();
        assert!(registry.is_full().await);

        registry.mark_closing(old).await;
        assert!(!registry.is_full().await);

        let new = registry.add(2u32, None).await.unwrap();
        assert_eq!(registry.state(old).await, None);
        assert_eq!(registry.state(new).await, Some(SessionState::Open));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_open_sinks_skips_closing() {
        let registry = SessionRegistry::new(10);
        let a = registry.add(1u32, None).await.unwrap();
        let b = registry.add(2u32, None).await.unwrap();
        registry.mark_closing(a).await;

        let sinks = registry.open_sinks().await;
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].0, b);
        assert_eq!(*sinks[0].1.lock().await, 2);
    }

    #[tokio::test]
    async fn test_reap_removes_only_closing() {
        let registry = SessionRegistry::new(10);
        let a = registry.add((), None).await.unwrap();
        let b = registry.add((), None).await.unwrap();
        let c = registry.add((), None).await.unwrap();

        assert!(registry.mark_closing(b).await);
        assert!(!registry.mark_closing(b).await);
        assert_eq!(registry.state(b).await, Some(SessionState::Closing));

        assert_eq!(registry.reap().await, vec![b]);
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.state(a).await, Some(SessionState::Open));
        assert_eq!(registry.state(b).await, None);
        assert_eq!(registry.state(c).await, Some(SessionState::Open));
        assert!(registry.reap().await.is_empty());
    }

    #[tokio::test]
    async fn test_reap_aborts_reader() {
        let registry = SessionRegistry::new(10);
        let id = registry.add((), None).await.unwrap();
        let reader = tokio::spawn(futures::future::pending::<()>());
        registry.attach_reader(id, reader.abort_handle()).await;

        registry.mark_closing(id).await;
        registry.reap().await;

        assert!(reader.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_reader_for_missing_session_is_aborted() {
        let registry: SessionRegistry<()> = SessionRegistry::new(10);
        let reader = tokio::spawn(futures::future::pending::<()>());

        registry.attach_reader(SessionId(7), reader.abort_handle()).await;

        assert!(reader.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_snapshot_and_for_each() {
        let registry = SessionRegistry::new(10);
        let peer: SocketAddr = "192.168.4.2:50000".parse().unwrap();
        let id = registry.add((), Some(peer)).await.unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].state, SessionState::Open);
        assert_eq!(snapshot[0].peer, Some(peer));

        let mut visited = 0;
        registry.for_each(|_| visited += 1).await;
        assert_eq!(visited, 1);
    }
}
