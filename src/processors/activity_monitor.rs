//! Inactivity watchdog: re-engage a silent conversation.
//!
//! Every frame passing through counts as activity. A background ticker
//! watches the shared activity clock; once the window elapses it feeds a
//! synthetic user prompt through the private `tick` port, which the
//! transform re-validates and emits as a context append with `run_llm`
//! set. The monitor re-arms only after new activity, so a silent user is
//! prompted once per lull, not repeatedly.

use crate::config::ActivityMonitorConfig;
use crate::context::Message;
use crate::error::Result;
use crate::frame::{ContextAppend, Frame, FramePayload, monotonic_ms};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorIo, ProcessorSpec, port};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Private in-port fed by the inactivity ticker.
pub const TICK: &str = "tick";

/// Emits a synthetic prompt after a configurable quiet period.
pub struct ActivityMonitor {
    timeout_ms: u64,
    last_activity: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
    prompt: String,
    tick_tx: Option<mpsc::Sender<Frame>>,
    tick_rx: Option<mpsc::Receiver<Frame>>,
    cancel: CancellationToken,
}

impl ActivityMonitor {
    /// Create an activity monitor.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`](crate::error::FlowError) for an empty
    /// prompt or zero window.
    pub fn new(config: ActivityMonitorConfig) -> Result<Self> {
        config.validate()?;
        let (tick_tx, tick_rx) = mpsc::channel(4);
        Ok(Self {
            timeout_ms: config.timeout_ms,
            last_activity: Arc::new(AtomicU64::new(monotonic_ms())),
            armed: Arc::new(AtomicBool::new(true)),
            prompt: config.prompt,
            tick_tx: Some(tick_tx),
            tick_rx: Some(tick_rx),
            cancel: CancellationToken::new(),
        })
    }

    fn prompt_frame(prompt: &str) -> Frame {
        Frame::new(FramePayload::LlmContextMessagesAppend(ContextAppend {
            messages: vec![Message::user(prompt)],
            tool_call: false,
            run_llm: true,
        }))
    }
}

impl Processor for ActivityMonitor {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "activity-monitor",
            ins: &[port::IN, port::SYS_IN, TICK],
            outs: &[port::OUT],
        }
    }

    fn take_io(&mut self) -> ProcessorIo {
        let mut io = ProcessorIo::default();
        if let Some(rx) = self.tick_rx.take() {
            io.background_in.push((TICK, rx));
        }
        io
    }

    fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Start => {
                self.last_activity.store(monotonic_ms(), Ordering::Relaxed);
                if let Some(tx) = self.tick_tx.take() {
                    tokio::spawn(inactivity_ticker(
                        tx,
                        self.prompt.clone(),
                        self.timeout_ms,
                        Arc::clone(&self.last_activity),
                        Arc::clone(&self.armed),
                        self.cancel.child_token(),
                    ));
                }
            }
            LifecycleEvent::Stop => self.cancel.cancel(),
            _ => {}
        }
        Ok(())
    }

    fn transform(&mut self, in_port: &str, frame: Frame) -> Result<Outputs> {
        if in_port == TICK {
            // Activity may have arrived between the ticker firing and now.
            let idle = monotonic_ms().saturating_sub(self.last_activity.load(Ordering::Relaxed));
            if idle < self.timeout_ms {
                return Ok(Outputs::none());
            }
            debug!(idle_ms = idle, "inactivity prompt fired");
            return Ok(Outputs::single(port::OUT, frame));
        }

        self.last_activity.store(monotonic_ms(), Ordering::Relaxed);
        self.armed.store(true, Ordering::Relaxed);
        Ok(Outputs::single(port::OUT, frame))
    }
}

/// Polls the activity clock and fires the prompt once per quiet period.
async fn inactivity_ticker(
    tx: mpsc::Sender<Frame>,
    prompt: String,
    timeout_ms: u64,
    last_activity: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let poll = Duration::from_millis((timeout_ms / 4).clamp(10, 1000));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll) => {
                let idle = monotonic_ms()
                    .saturating_sub(last_activity.load(Ordering::Relaxed));
                if idle >= timeout_ms && armed.swap(false, Ordering::Relaxed) {
                    if tx.send(ActivityMonitor::prompt_frame(&prompt)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!("inactivity ticker exited");
}
