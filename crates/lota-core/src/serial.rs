//! Serial event model and processing.
//!
//! The serial driver announces activity as a stream of [`SerialEvent`]s.
//! [`SerialEventProcessor`] consumes them one at a time, reads the announced
//! bytes from the driver and tells its caller what to do next:
//!
//! - forward a data payload to connected clients
//! - drop the event backlog after an overflow flush
//! - nothing, for faults that are only logged
//!
//! Events travel from the driver to the processor as [`QueuedEvent`]s,
//! stamped with the driver's input generation. A flush starts a new
//! generation, so every event queued before it is recognised as stale no
//! matter when it is dequeued.
//!
//! [`PatternScanner`] finds in-band marker runs (`+++` by default) in raw
//! input for drivers that have no hardware pattern detection.

use crate::config::SerialConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Bound on reads that complete a pattern notification.
const PATTERN_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on reads that complete a data notification.
const DATA_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Notification from the serial driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEvent {
    /// `n` bytes are ready to read.
    Data(usize),
    /// The hardware FIFO overran.
    FifoOverflow,
    /// The receive ring buffer is full.
    BufferFull,
    /// A marker pattern starts `n` bytes into the unread input.
    /// `None` means the driver lost track of pattern positions.
    PatternDetected(Option<usize>),
    Break,
    ParityError,
    FrameError,
    /// Any other driver event, by its raw code.
    Unknown(i32),
}

/// A driver event together with the input generation it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    pub event: SerialEvent,
    pub generation: u64,
}

impl QueuedEvent {
    pub fn new(event: SerialEvent, generation: u64) -> Self {
        Self { event, generation }
    }
}

/// Errors reported by a [`SerialDriver`].
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial read timed out after {0:?}")]
    Timeout(Duration),
}

/// Access to the buffered side of a serial port.
pub trait SerialDriver: Send {
    /// Read up to `buf.len()` bytes, waiting at most `timeout` for them.
    ///
    /// Returns the number of bytes read, which is zero when nothing arrived.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError>;

    /// Queue bytes for transmission.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, SerialError>;

    /// Discard everything buffered on the receive side.
    fn flush_input(&mut self) -> Result<(), SerialError>;

    /// Bytes buffered on the receive side.
    fn buffered_len(&self) -> usize;

    /// Current input generation. Must change on every [`flush_input`].
    ///
    /// Drivers that never queue events ahead of their data keep the default.
    ///
    /// [`flush_input`]: SerialDriver::flush_input
    fn generation(&self) -> u64 {
        0
    }
}

/// What the caller should do after an event was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialOutcome {
    /// Deliver these bytes to clients.
    Forward(Vec<u8>),
    /// Input was flushed; queued events are stale.
    Flushed,
    /// A marker pattern and the bytes before it were consumed.
    PatternConsumed { segment: Vec<u8>, marker: Vec<u8> },
    /// Nothing to do.
    Ignored,
}

impl SerialOutcome {
    /// Whether events queued before this outcome describe discarded input.
    pub fn discards_backlog(&self) -> bool {
        matches!(self, SerialOutcome::Flushed)
    }
}

/// Single consumer of serial driver events.
pub struct SerialEventProcessor<D> {
    driver: D,
    scratch: Vec<u8>,
    pattern_len: usize,
    echo: bool,
}

impl<D: SerialDriver> SerialEventProcessor<D> {
    pub fn new(driver: D, config: &SerialConfig) -> Self {
        Self {
            driver,
            scratch: vec![0; config.rx_buffer_size.max(1)],
            pattern_len: config.pattern_len,
            echo: config.echo,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Whether `queued` was announced before the last input flush.
    pub fn is_stale(&self, queued: &QueuedEvent) -> bool {
        queued.generation != self.driver.generation()
    }

    /// Handle one driver event.
    pub fn process(&mut self, event: SerialEvent) -> SerialOutcome {
        match event {
            SerialEvent::Data(size) => {
                debug!(target: "uart_event", "[UART DATA]: {}", size);
                let data = self.read_up_to(size, DATA_READ_TIMEOUT);
                if data.len() < size {
                    warn!(
                        target: "uart_event",
                        "Short read: announced {} bytes, got {}",
                        size,
                        data.len()
                    );
                }
                if data.is_empty() {
                    return SerialOutcome::Ignored;
                }
                if self.echo {
                    if let Err(e) = self.driver.write_bytes(&data) {
                        warn!(target: "uart_event", "Echo failed: {}", e);
                    }
                }
                SerialOutcome::Forward(data)
            }
            SerialEvent::FifoOverflow => {
                warn!(target: "uart_event", "hw fifo overflow");
                self.flush()
            }
            SerialEvent::BufferFull => {
                warn!(target: "uart_event", "ring buffer full");
                self.flush()
            }
            SerialEvent::PatternDetected(None) => {
                warn!(target: "uart_event", "Pattern queue size too small");
                self.flush()
            }
            SerialEvent::PatternDetected(Some(pos)) => {
                let buffered = self.driver.buffered_len();
                let segment = self.read_up_to(pos, PATTERN_READ_TIMEOUT);
                let marker = self.read_up_to(self.pattern_len, PATTERN_READ_TIMEOUT);
                info!(
                    target: "uart_event",
                    "[UART PATTERN DETECTED] pos: {}, buffered size: {}", pos, buffered
                );
                debug!(target: "uart_event", "read data: {}", String::from_utf8_lossy(&segment));
                debug!(target: "uart_event", "read pat : {}", String::from_utf8_lossy(&marker));
                SerialOutcome::PatternConsumed { segment, marker }
            }
            SerialEvent::Break => {
                warn!(target: "uart_event", "uart rx break");
                SerialOutcome::Ignored
            }
            SerialEvent::ParityError => {
                warn!(target: "uart_event", "uart parity error");
                SerialOutcome::Ignored
            }
            SerialEvent::FrameError => {
                warn!(target: "uart_event", "uart frame error");
                SerialOutcome::Ignored
            }
            SerialEvent::Unknown(code) => {
                info!(target: "uart_event", "uart event type: {}", code);
                SerialOutcome::Ignored
            }
        }
    }

    fn flush(&mut self) -> SerialOutcome {
        if let Err(e) = self.driver.flush_input() {
            error!(target: "uart_event", "Input flush failed: {}", e);
        }
        SerialOutcome::Flushed
    }

    /// Read `size` bytes in scratch-sized slices, stopping early when the
    /// driver runs dry.
    fn read_up_to(&mut self, size: usize, timeout: Duration) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let want = (size - out.len()).min(self.scratch.len());
            match self.driver.read_bytes(&mut self.scratch[..want], timeout) {
                Ok(0) | Err(SerialError::Timeout(_)) => break,
                Ok(n) => out.extend_from_slice(&self.scratch[..n]),
                Err(e) => {
                    warn!(target: "uart_event", "Read failed: {}", e);
                    break;
                }
            }
        }
        out
    }
}

/// Result of scanning raw input for marker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// Plain bytes with no pattern.
    Data(Vec<u8>),
    /// A complete marker run, preceded by `segment`.
    Pattern { segment: Vec<u8> },
}

/// Incremental detector for runs of `len` identical marker bytes.
///
/// A marker run split across two chunks is still detected: trailing marker
/// bytes are held back until the run completes, breaks, or [`flush`] is
/// called.
///
/// [`flush`]: PatternScanner::flush
#[derive(Debug, Clone)]
pub struct PatternScanner {
    marker: u8,
    len: usize,
    pending: Vec<u8>,
    run: usize,
}

impl PatternScanner {
    pub fn new(marker: u8, len: usize) -> Self {
        Self {
            marker,
            len: len.max(1),
            pending: Vec::new(),
            run: 0,
        }
    }

    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.pattern_byte(), config.pattern_len)
    }

    /// Marker bytes per pattern.
    pub fn pattern_len(&self) -> usize {
        self.len
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ScanItem> {
        let mut items = Vec::new();
        for &byte in chunk {
            self.pending.push(byte);
            if byte != self.marker {
                self.run = 0;
                continue;
            }
            self.run += 1;
            if self.run == self.len {
                self.pending.truncate(self.pending.len() - self.len);
                items.push(ScanItem::Pattern {
                    segment: std::mem::take(&mut self.pending),
                });
                self.run = 0;
            }
        }

        if self.pending.len() > self.run {
            let held = self.pending.split_off(self.pending.len() - self.run);
            items.push(ScanItem::Data(std::mem::replace(&mut self.pending, held)));
        }
        items
    }

    /// Release held-back marker bytes as plain data.
    pub fn flush(&mut self) -> Option<ScanItem> {
        self.run = 0;
        if self.pending.is_empty() {
            None
        } else {
            Some(ScanItem::Data(std::mem::take(&mut self.pending)))
        }
    }
}
