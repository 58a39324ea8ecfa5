//! Channel fabric: bounded frame queues and drop-oldest observability.
//!
//! Data and system edges are bounded `mpsc` channels — producers await on a
//! full channel, which is the backpressure mechanism. Observability streams
//! use `broadcast` ring buffers instead: publishing never blocks and slow
//! consumers lose the oldest entries.

use crate::frame::Frame;
use tokio::sync::{broadcast, mpsc};

/// Capacity of data edges.
pub const DATA_CHANNEL_CAPACITY: usize = 1024;
/// Capacity of system/control edges.
pub const SYSTEM_CHANNEL_CAPACITY: usize = 10;
/// Ring size of the report/error observability streams.
pub const REPORT_CHANNEL_CAPACITY: usize = 256;

/// A bounded channel for data frames.
pub fn data_channel() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(DATA_CHANNEL_CAPACITY)
}

/// A bounded channel for system frames.
pub fn system_channel() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(SYSTEM_CHANNEL_CAPACITY)
}

/// An out-of-band progress report from a processor worker.
#[derive(Debug, Clone)]
pub struct ReportEvent {
    /// Node id the report came from.
    pub node: String,
    /// Human-readable report.
    pub message: String,
    /// Monotonic timestamp in milliseconds.
    pub ts: u64,
}

/// An out-of-band error report from a processor worker.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Node id the error came from.
    pub node: String,
    /// The error description.
    pub error: String,
    /// Monotonic timestamp in milliseconds.
    pub ts: u64,
}

/// A never-blocking publisher with drop-oldest overflow.
///
/// Wraps a `broadcast` sender: with no subscribers or a full ring the send
/// simply discards, so workers can publish from hot paths without awaiting.
#[derive(Debug, Clone)]
pub struct ObservabilitySender<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> ObservabilitySender<T> {
    /// Create a sender with the standard ring size.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Never blocks, never fails.
    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone> Default for ObservabilitySender<T> {
    fn default() -> Self {
        Self::new()
    }
}
