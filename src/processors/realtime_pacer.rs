//! Wall-clock paced audio delivery.
//!
//! Output transports observe interruptions only if audio leaves the process
//! at real-time rate, so the pacer meters frames out at half the nominal
//! chunk duration. Frames queue on a private channel tagged with the
//! current interrupt epoch; a barge-in bumps the epoch, which flushes
//! everything still queued and resets the send clock.

use crate::config::RealtimePacerConfig;
use crate::error::Result;
use crate::frame::{Frame, FramePayload, monotonic_ms};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorSpec, port};
use crate::transport::{FrameSerializer, OutboundMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Capacity of the private delivery queue. Matches the data-edge capacity
/// upstream so a blocked transport backpressures the graph instead of
/// overflowing here.
const PACE_QUEUE_CAPACITY: usize = 1024;

enum PacerCommand {
    Deliver { epoch: u64, frame: Frame },
    SetSerializer(Arc<dyn FrameSerializer>),
}

/// Meters output audio to wall-clock rate.
pub struct RealtimePacer {
    supports_interrupt: bool,
    sending_interval_ms: u64,
    epoch: Arc<AtomicU64>,
    cmd_tx: mpsc::Sender<PacerCommand>,
    cmd_rx: Option<mpsc::Receiver<PacerCommand>>,
    out_channel: Option<mpsc::Sender<OutboundMessage>>,
    cancel: CancellationToken,
}

impl RealtimePacer {
    /// Create a pacer delivering to the configured external channel.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`](crate::error::FlowError) for a zero
    /// chunk duration.
    pub fn new(config: RealtimePacerConfig) -> Result<Self> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(PACE_QUEUE_CAPACITY);
        Ok(Self {
            supports_interrupt: config.supports_interrupt,
            sending_interval_ms: config.duration_ms / 2,
            epoch: Arc::new(AtomicU64::new(0)),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            out_channel: Some(config.out_channel),
            cancel: CancellationToken::new(),
        })
    }

    fn enqueue(&self, command: PacerCommand) {
        match self.cmd_tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The queue is sized to the inbound edge; hitting this means
                // the transport stalled for the whole backlog.
                error!("pacer queue overflow, dropping audio frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("pacer worker gone, dropping frame");
            }
        }
    }
}

impl Processor for RealtimePacer {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "realtime-out",
            ins: &[port::IN, port::SYS_IN],
            outs: &[],
        }
    }

    fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Start => {
                if let (Some(rx), Some(out)) = (self.cmd_rx.take(), self.out_channel.take()) {
                    tokio::spawn(pacer_worker(
                        rx,
                        out,
                        self.sending_interval_ms,
                        Arc::clone(&self.epoch),
                        self.cancel.child_token(),
                    ));
                }
            }
            LifecycleEvent::Stop => self.cancel.cancel(),
            _ => {}
        }
        Ok(())
    }

    fn transform(&mut self, _port: &str, frame: Frame) -> Result<Outputs> {
        match frame.payload {
            FramePayload::AudioOutputRaw(_) => {
                self.enqueue(PacerCommand::Deliver {
                    epoch: self.epoch.load(Ordering::Relaxed),
                    frame,
                });
            }
            FramePayload::SystemConfigChange(ref delta) => {
                if let Some(serializer) = delta.serializer.clone() {
                    debug!("installing output serializer");
                    self.enqueue(PacerCommand::SetSerializer(serializer));
                }
            }
            FramePayload::ControlInterruptStart => {
                if self.supports_interrupt {
                    // Everything queued under the old epoch is dropped.
                    self.epoch.fetch_add(1, Ordering::Relaxed);
                    debug!("interrupt: flushing queued audio");
                }
            }
            _ => {}
        }
        Ok(Outputs::none())
    }
}

/// Delivery loop: sleep to the send clock, serialize, hand off.
async fn pacer_worker(
    mut rx: mpsc::Receiver<PacerCommand>,
    out: mpsc::Sender<OutboundMessage>,
    sending_interval_ms: u64,
    epoch: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut serializer: Option<Arc<dyn FrameSerializer>> = None;
    let mut next_send_ms: u64 = 0;
    let mut last_epoch = epoch.load(Ordering::Relaxed);

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => command,
        };
        match command {
            None => break,
            Some(PacerCommand::SetSerializer(s)) => serializer = Some(s),
            Some(PacerCommand::Deliver { epoch: tagged, frame }) => {
                let current = epoch.load(Ordering::Relaxed);
                if tagged < current {
                    continue;
                }
                if current != last_epoch {
                    last_epoch = current;
                    next_send_ms = monotonic_ms();
                }

                let now = monotonic_ms();
                let wait = next_send_ms.saturating_sub(now);
                if wait > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    }
                    // Barge-in while sleeping: this frame is stale now.
                    if epoch.load(Ordering::Relaxed) != current {
                        continue;
                    }
                }

                let message = match &serializer {
                    Some(serializer) => match serializer.serialize(&frame) {
                        Ok(text) => OutboundMessage::Serialized(text),
                        Err(e) => {
                            warn!("serializer rejected frame, passing raw: {e}");
                            OutboundMessage::Raw(frame)
                        }
                    },
                    None => OutboundMessage::Raw(frame),
                };
                if out.send(message).await.is_err() {
                    debug!("output channel closed, pacer exiting");
                    break;
                }
                next_send_ms = now + sending_interval_ms;
            }
        }
    }
}
