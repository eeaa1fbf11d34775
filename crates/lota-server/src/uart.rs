//! Software UART driver and serial event runner.
//!
//! Host serial ports only offer a byte stream. [`SoftUart`] rebuilds the
//! event-driven driver model on top of it: a reader thread feeds incoming
//! bytes through [`UartIngest`] into a bounded receive ring and announces
//! them on a bounded event channel, detecting marker patterns on the way.
//! The buffering limits behave like the hardware driver's:
//!
//! - a chunk that does not fit the ring is dropped and `BufferFull` is sent
//! - a chunk whose event does not fit the channel is dropped and a
//!   `FifoOverflow` is sent as soon as the channel has room
//! - a pattern found while the position queue is full is reported without
//!   a position
//!
//! Every event is stamped with the ring's generation while the ring is
//! locked, and a flush starts a new generation under the same lock. Events
//! describing flushed bytes are therefore always recognised as stale.
//!
//! [`spawn_serial_processor`] runs the single event consumer on its own
//! thread and forwards data to the broadcast relay.

use std::collections::VecDeque;
use std::fmt::Display;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use futures::Sink;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use lota_core::{
    PatternScanner, QueuedEvent, ScanItem, SerialConfig, SerialDriver, SerialError,
    SerialEvent, SerialEventProcessor, SerialOutcome,
};
use lota_protocol::Frame;

use crate::relay::BroadcastRelay;

/// Pause after a port error before reading again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct RxState {
    ring: VecDeque<u8>,
    capacity: usize,
    /// Stream offsets just past each unread pattern.
    positions: VecDeque<u64>,
    read_offset: u64,
    write_offset: u64,
    /// Bumped by every flush.
    generation: u64,
}

struct Shared {
    state: Mutex<RxState>,
    data_ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Driver side of the software UART: the receive ring plus the transmitter.
pub struct SoftUart<W> {
    shared: Arc<Shared>,
    writer: W,
}

impl<W: Write + Send> SoftUart<W> {
    /// Create the driver, its ingest side and the event channel.
    pub fn new(
        config: &SerialConfig,
        writer: W,
    ) -> (Self, UartIngest, mpsc::Receiver<QueuedEvent>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(RxState {
                ring: VecDeque::with_capacity(config.rx_buffer_size),
                capacity: config.rx_buffer_size,
                positions: VecDeque::with_capacity(config.pattern_queue_len),
                read_offset: 0,
                write_offset: 0,
                generation: 0,
            }),
            data_ready: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel(config.event_queue_len.max(1));

        let ingest = UartIngest {
            shared: shared.clone(),
            events: tx,
            scanner: PatternScanner::from_config(config),
            marker: config.pattern_byte(),
            pattern_queue_len: config.pattern_queue_len,
            overflow_pending: false,
        };
        (Self { shared, writer }, ingest, rx)
    }
}

impl<W: Write + Send> SerialDriver for SoftUart<W> {
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.ring.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            state = self
                .shared
                .data_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let n = buf.len().min(state.ring.len());
        for (slot, byte) in buf.iter_mut().zip(state.ring.drain(..n)) {
            *slot = byte;
        }
        state.read_offset += n as u64;
        let read_offset = state.read_offset;
        while state.positions.front().is_some_and(|&end| end <= read_offset) {
            state.positions.pop_front();
        }
        Ok(n)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, SerialError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(data.len())
    }

    fn flush_input(&mut self) -> Result<(), SerialError> {
        let mut state = self.shared.lock();
        let discarded = state.ring.len();
        state.ring.clear();
        state.positions.clear();
        state.read_offset += discarded as u64;
        state.generation += 1;
        debug!(target: "uart_event", "Flushed {} buffered bytes", discarded);
        Ok(())
    }

    fn buffered_len(&self) -> usize {
        self.shared.lock().ring.len()
    }

    fn generation(&self) -> u64 {
        self.shared.lock().generation
    }
}

/// Receive side of the software UART, fed with raw port bytes.
pub struct UartIngest {
    shared: Arc<Shared>,
    events: mpsc::Sender<QueuedEvent>,
    scanner: PatternScanner,
    marker: u8,
    pattern_queue_len: usize,
    overflow_pending: bool,
}

impl UartIngest {
    /// Accept a chunk read from the port.
    pub fn ingest(&mut self, chunk: &[u8]) {
        for item in self.scanner.feed(chunk) {
            self.push(item);
        }
    }

    /// Release marker bytes held back by the pattern scanner. Called when
    /// the port goes quiet.
    pub fn flush_pending(&mut self) {
        if let Some(item) = self.scanner.flush() {
            self.push(item);
        }
    }

    /// Announce a line condition.
    pub fn emit(&mut self, event: SerialEvent) {
        let shared = self.shared.clone();
        let state = shared.lock();
        self.send(&state, event);
    }

    /// Queue `event` stamped with the current generation. The caller holds
    /// the ring lock.
    fn send(&mut self, state: &RxState, event: SerialEvent) -> bool {
        match self.events.try_send(QueuedEvent::new(event, state.generation)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow_pending = true;
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn push(&mut self, item: ScanItem) {
        let shared = self.shared.clone();
        let mut state = shared.lock();

        if self.overflow_pending {
            self.overflow_pending = false;
            if !self.send(&state, SerialEvent::FifoOverflow) {
                return;
            }
        }

        let (bytes, pattern_len) = match item {
            ScanItem::Data(bytes) => (bytes, 0),
            ScanItem::Pattern { segment } => (segment, self.scanner.pattern_len()),
        };
        let total = bytes.len() + pattern_len;

        if state.ring.len() + total > state.capacity {
            warn!(target: "uart_rx", "Receive ring full, dropping {} bytes", total);
            self.send(&state, SerialEvent::BufferFull);
            return;
        }

        let permit = match self.events.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                warn!(target: "uart_rx", "Event queue full, dropping {} bytes", total);
                self.overflow_pending = true;
                return;
            }
            Err(TrySendError::Closed(())) => return,
        };

        state.ring.extend(bytes.iter().copied());
        let event = if pattern_len == 0 {
            SerialEvent::Data(bytes.len())
        } else {
            state
                .ring
                .extend(std::iter::repeat(self.marker).take(pattern_len));
            if state.positions.len() >= self.pattern_queue_len {
                SerialEvent::PatternDetected(None)
            } else {
                let end = state.write_offset + total as u64;
                state.positions.push_back(end);
                SerialEvent::PatternDetected(Some(bytes.len()))
            }
        };
        state.write_offset += total as u64;
        permit.send(QueuedEvent::new(event, state.generation));
        drop(state);

        shared.data_ready.notify_all();
    }

    /// Feed everything `reader` produces on a dedicated thread.
    ///
    /// Read timeouts release held-back marker bytes. The thread ends when
    /// the port reports end of stream or a broken line.
    pub fn spawn<R>(mut self, mut reader: R) -> io::Result<thread::JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        thread::Builder::new()
            .name("uart_rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 256];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            self.flush_pending();
                            info!(target: "uart_rx", "Serial port closed");
                            break;
                        }
                        Ok(n) => self.ingest(&buf[..n]),
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                            ) =>
                        {
                            self.flush_pending()
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            let event = event_for_error(&e);
                            warn!(target: "uart_rx", "Serial read failed: {}", e);
                            self.emit(event);
                            if event == SerialEvent::Break {
                                break;
                            }
                            thread::sleep(ERROR_BACKOFF);
                        }
                    }
                }
            })
    }
}

/// Driver event reported for a port read error.
pub fn event_for_error(error: &io::Error) -> SerialEvent {
    match error.kind() {
        io::ErrorKind::InvalidData => SerialEvent::FrameError,
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => SerialEvent::Break,
        _ => SerialEvent::Unknown(error.raw_os_error().unwrap_or(-1)),
    }
}

/// Run one queued event through `processor` and return the bytes to
/// broadcast, if any.
///
/// Events announced before the last flush describe discarded input and are
/// dropped unprocessed.
pub fn process_queued<D: SerialDriver>(
    processor: &mut SerialEventProcessor<D>,
    queued: QueuedEvent,
) -> Option<Vec<u8>> {
    if processor.is_stale(&queued) {
        debug!(target: "uart_event", "Discarding stale {:?}", queued.event);
        return None;
    }

    match processor.process(queued.event) {
        SerialOutcome::Forward(bytes) => Some(bytes),
        outcome if outcome.discards_backlog() => {
            info!(target: "uart_event", "Input flushed, queued events are stale");
            None
        }
        _ => None,
    }
}

/// Run the serial event consumer on a dedicated thread.
///
/// Forwarded data is broadcast through `runtime`. The thread ends when the
/// event channel closes.
pub fn spawn_serial_processor<D, S>(
    mut processor: SerialEventProcessor<D>,
    mut events: mpsc::Receiver<QueuedEvent>,
    relay: Arc<BroadcastRelay<S>>,
    runtime: Handle,
) -> io::Result<thread::JoinHandle<()>>
where
    D: SerialDriver + 'static,
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    thread::Builder::new()
        .name("uart_event".to_string())
        .spawn(move || {
            while let Some(queued) = events.blocking_recv() {
                if let Some(bytes) = process_queued(&mut processor, queued) {
                    let len = bytes.len();
                    let delivered = runtime.block_on(relay.broadcast(&Frame::from_serial(bytes)));
                    debug!(
                        target: "uart_event",
                        "Relayed {} bytes to {} session(s)", len, delivered
                    );
                }
            }
            info!(target: "uart_event", "Serial event source closed");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    use crate::registry::SessionRegistry;

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn uart(config: &SerialConfig) -> (SoftUart<SharedWriter>, UartIngest, mpsc::Receiver<QueuedEvent>) {
        SoftUart::new(config, SharedWriter::default())
    }

    fn next(events: &mut mpsc::Receiver<QueuedEvent>) -> SerialEvent {
        events.try_recv().unwrap().event
    }

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn test_data_chunk_is_announced() {
        let (mut driver, mut ingest, mut events) = uart(&SerialConfig::default());

        ingest.ingest(b"ABC");

        assert_eq!(next(&mut events), SerialEvent::Data(3));
        let mut buf = [0u8; 8];
        assert_eq!(driver.read_bytes(&mut buf, SHORT).unwrap(), 3);
        assert_eq!(&buf[..3], b"ABC");
        assert_eq!(driver.read_bytes(&mut buf, SHORT).unwrap(), 0);
    }

    #[test]
    fn test_pattern_is_positioned_for_processor() {
        let config = SerialConfig::default();
        let (driver, mut ingest, mut events) = uart(&config);
        let mut processor = SerialEventProcessor::new(driver, &config);

        ingest.ingest(b"ab+++cd");

        let first = next(&mut events);
        assert_eq!(first, SerialEvent::PatternDetected(Some(2)));
        assert_eq!(
            processor.process(first),
            SerialOutcome::PatternConsumed {
                segment: b"ab".to_vec(),
                marker: b"+++".to_vec(),
            }
        );

        let second = next(&mut events);
        assert_eq!(second, SerialEvent::Data(2));
        assert_eq!(processor.process(second), SerialOutcome::Forward(b"cd".to_vec()));
    }

    #[test]
    fn test_flush_invalidates_events_queued_before_it() {
        let config = SerialConfig::default();
        let (driver, mut ingest, mut events) = uart(&config);
        let mut processor = SerialEventProcessor::new(driver, &config);

        ingest.emit(SerialEvent::FifoOverflow);
        ingest.ingest(b"old");
        let overflow = events.try_recv().unwrap();
        assert_eq!(process_queued(&mut processor, overflow), None);
        assert_eq!(processor.driver().buffered_len(), 0);

        // Arrives while the stale Data(3) is still queued.
        ingest.ingest(b"late");
        ingest.ingest(b"next");

        let mut forwarded = Vec::new();
        while let Ok(queued) = events.try_recv() {
            forwarded.extend(process_queued(&mut processor, queued));
        }
        assert_eq!(forwarded, vec![b"late".to_vec(), b"next".to_vec()]);
        assert_eq!(processor.driver().buffered_len(), 0);
    }

    #[test]
    fn test_backlog_behind_overflow_is_discarded() {
        let config = SerialConfig::default();
        let (driver, mut ingest, mut events) = uart(&config);
        let mut processor = SerialEventProcessor::new(driver, &config);

        ingest.ingest(b"one");
        ingest.ingest(b"two");
        ingest.emit(SerialEvent::BufferFull);
        ingest.ingest(b"three");

        let mut forwarded = Vec::new();
        while let Ok(queued) = events.try_recv() {
            forwarded.extend(process_queued(&mut processor, queued));
        }
        assert_eq!(forwarded, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(processor.driver().buffered_len(), 0);

        ingest.ingest(b"fresh");
        let queued = events.try_recv().unwrap();
        assert_eq!(process_queued(&mut processor, queued), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_held_marker_released_on_flush() {
        let (_driver, mut ingest, mut events) = uart(&SerialConfig::default());

        ingest.ingest(b"x++");
        assert_eq!(next(&mut events), SerialEvent::Data(1));
        assert!(events.try_recv().is_err());

        ingest.flush_pending();
        assert_eq!(next(&mut events), SerialEvent::Data(2));
    }

    #[test]
    fn test_full_ring_reports_buffer_full() {
        let config = SerialConfig {
            rx_buffer_size: 8,
            ..Default::default()
        };
        let (driver, mut ingest, mut events) = uart(&config);

        ingest.ingest(b"0123456789");

        assert_eq!(next(&mut events), SerialEvent::BufferFull);
        assert_eq!(driver.buffered_len(), 0);
    }

    #[test]
    fn test_full_event_queue_reports_overflow() {
        let config = SerialConfig {
            event_queue_len: 1,
            ..Default::default()
        };
        let (driver, mut ingest, mut events) = uart(&config);

        ingest.ingest(b"a");
        ingest.ingest(b"b");
        assert_eq!(next(&mut events), SerialEvent::Data(1));

        ingest.ingest(b"c");
        assert_eq!(next(&mut events), SerialEvent::FifoOverflow);
        assert_eq!(driver.buffered_len(), 1);
    }

    #[test]
    fn test_exhausted_position_queue() {
        let config = SerialConfig {
            pattern_queue_len: 1,
            ..Default::default()
        };
        let (mut driver, mut ingest, mut events) = uart(&config);

        ingest.ingest(b"+++");
        ingest.ingest(b"+++");

        assert_eq!(next(&mut events), SerialEvent::PatternDetected(Some(0)));
        assert_eq!(next(&mut events), SerialEvent::PatternDetected(None));

        driver.flush_input().unwrap();
        ingest.ingest(b"+++");
        assert_eq!(next(&mut events), SerialEvent::PatternDetected(Some(0)));
    }

    #[test]
    fn test_consumed_pattern_frees_position() {
        let config = SerialConfig {
            pattern_queue_len: 1,
            ..Default::default()
        };
        let (mut driver, mut ingest, mut events) = uart(&config);

        ingest.ingest(b"+++");
        let mut buf = [0u8; 3];
        assert_eq!(driver.read_bytes(&mut buf, SHORT).unwrap(), 3);
        ingest.ingest(b"+++");

        assert_eq!(next(&mut events), SerialEvent::PatternDetected(Some(0)));
        assert_eq!(next(&mut events), SerialEvent::PatternDetected(Some(0)));
    }

    #[test]
    fn test_echo_goes_to_writer() {
        let config = SerialConfig::default();
        let writer = SharedWriter::default();
        let (driver, mut ingest, mut events) = SoftUart::new(&config, writer.clone());
        let mut processor = SerialEventProcessor::new(driver, &config);

        ingest.ingest(b"ping");
        let outcome = processor.process(next(&mut events));

        assert_eq!(outcome, SerialOutcome::Forward(b"ping".to_vec()));
        assert_eq!(writer.0.lock().unwrap().as_slice(), b"ping");
    }

    #[test]
    fn test_reader_thread_feeds_until_eof() {
        let (_driver, ingest, mut events) = uart(&SerialConfig::default());

        ingest
            .spawn(Cursor::new(b"hello".to_vec()))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(next(&mut events), SerialEvent::Data(5));
        assert!(events.blocking_recv().is_none());
    }

    #[test]
    fn test_read_errors_map_to_line_events() {
        let error = |kind| io::Error::new(kind, "port");
        assert_eq!(
            event_for_error(&error(io::ErrorKind::InvalidData)),
            SerialEvent::FrameError
        );
        assert_eq!(
            event_for_error(&error(io::ErrorKind::BrokenPipe)),
            SerialEvent::Break
        );
        assert_eq!(
            event_for_error(&io::Error::from_raw_os_error(5)),
            SerialEvent::Unknown(5)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serial_data_reaches_sessions() {
        let config = SerialConfig::default();
        let registry = Arc::new(SessionRegistry::new(10));
        let relay = Arc::new(BroadcastRelay::new(registry.clone(), Duration::from_secs(1)));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = futures::channel::mpsc::channel(8);
            registry.add(tx, None).await.unwrap();
            receivers.push(rx);
        }

        let (driver, mut ingest, events) = uart(&config);
        let processor = SerialEventProcessor::new(driver, &config);
        let consumer =
            spawn_serial_processor(processor, events, relay, Handle::current()).unwrap();

        ingest.ingest(b"ABC");
        for rx in &mut receivers {
            assert_eq!(rx.next().await, Some(Message::Text("ABC".to_string())));
        }

        drop(ingest);
        tokio::task::spawn_blocking(move || consumer.join().unwrap())
            .await
            .unwrap();
    }
}
