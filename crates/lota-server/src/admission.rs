//! Connection admission queue.
//!
//! Accepted sockets are handed from the accept loop to the worker pool
//! through a bounded queue. When the queue stays full for longer than the
//! enqueue timeout, the connection is handed back to the caller, which
//! closes it. Workers compete for items; each item reaches exactly one
//! worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Mutex;

/// A socket accepted by the listener and not yet dispatched.
///
/// Moved by value from the listener into the queue and from the queue into
/// exactly one worker.
#[derive(Debug)]
pub struct PendingConnection<S = TcpStream> {
    pub stream: S,
    pub peer: SocketAddr,
    pub accepted_at: Instant,
    /// Negotiation buffer filled by the dispatcher's first read.
    pub buffer: Vec<u8>,
}

impl<S> PendingConnection<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            accepted_at: Instant::now(),
            buffer: Vec::new(),
        }
    }
}

/// Rejected enqueue. The item is handed back.
#[derive(Debug, Error)]
pub enum EnqueueError<T> {
    /// No space became available in time.
    #[error("Admission queue full")]
    Timeout(T),

    /// The queue no longer delivers items.
    #[error("Admission queue closed")]
    Closed(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Timeout(item) | EnqueueError::Closed(item) => item,
        }
    }
}

/// Producer side of the bounded hand-off queue.
pub struct AdmissionQueue<T> {
    tx: mpsc::Sender<T>,
    timeout: Duration,
}

/// Consumer side of the queue. Clone it once per worker.
pub struct AdmissionWorker<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for AdmissionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> Clone for AdmissionWorker<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> AdmissionQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. [`RelayConfig::validate`] rejects that.
    ///
    /// [`RelayConfig::validate`]: lota_core::RelayConfig::validate
    pub fn new(capacity: usize, timeout: Duration) -> (Self, AdmissionWorker<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = AdmissionWorker {
            rx: Arc::new(Mutex::new(rx)),
        };
        (Self { tx, timeout }, worker)
    }

    /// Add an item, waiting up to the enqueue timeout for space.
    ///
    /// Fails with [`EnqueueError::Closed`] once every worker handle is gone.
    pub async fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        match self.tx.send_timeout(item, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => Err(EnqueueError::Timeout(item)),
            Err(SendTimeoutError::Closed(item)) => Err(EnqueueError::Closed(item)),
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<T> AdmissionWorker<T> {
    /// Take the next item, waiting as long as it takes.
    ///
    /// Returns `None` once every producer is gone and the queue is drained.
    pub async fn dequeue(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects_after_timeout() {
        let (queue, _worker) = AdmissionQueue::new(10, TIMEOUT);
        for i in 0..10 {
            queue.enqueue(i).await.unwrap();
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.capacity(), 10);

        let start = time::Instant::now();
        let err = queue.enqueue(10).await.unwrap_err();
        let waited = start.elapsed();

        assert!(matches!(err, EnqueueError::Timeout(10)));
        assert!(waited >= TIMEOUT);
        assert!(waited < TIMEOUT + Duration::from_millis(50));
        assert_eq!(queue.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_waits_for_space() {
        let (queue, worker) = AdmissionQueue::new(1, TIMEOUT);
        queue.enqueue(1).await.unwrap();

        let consumer = worker.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            consumer.dequeue().await
        });

        queue.enqueue(2).await.unwrap();
        assert_eq!(worker.dequeue().await, Some(2));
    }

    #[tokio::test]
    async fn test_each_item_reaches_one_worker() {
        let (queue, worker) = AdmissionQueue::new(4, TIMEOUT);
        let received = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let worker = worker.clone();
                let received = received.clone();
                tokio::spawn(async move {
                    while let Some(item) = worker.dequeue().await {
                        received.lock().await.push(item);
                    }
                })
            })
            .collect();
        drop(worker);

        for i in 0..50 {
            queue.enqueue(i).await.unwrap();
        }
        drop(queue);
        for handle in workers {
            handle.await.unwrap();
        }

        let mut received = received.lock().await.clone();
        received.sort_unstable();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_no_workers_hands_item_back() {
        let (queue, worker) = AdmissionQueue::new(2, TIMEOUT);
        drop(worker);

        let err = queue.enqueue("conn").await.unwrap_err();
        assert!(matches!(err, EnqueueError::Closed(_)));
        assert_eq!(err.into_inner(), "conn");
    }
}
