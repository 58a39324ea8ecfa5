//! Processor contract and the per-node worker loop.
//!
//! A processor is a state machine behind four operations: `describe` (port
//! declaration), construction (config validation, background workers),
//! `transition` (lifecycle), and `transform` (frame in, frames out).
//! `transform` never blocks on I/O — blocking work lives in background
//! workers that feed frames back through private in-ports, which the worker
//! loop polls exactly like external inputs.

use crate::channel::{ErrorEvent, ObservabilitySender, ReportEvent};
use crate::error::Result;
use crate::frame::{Frame, FrameKind, monotonic_ms};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

/// Well-known port names.
pub mod port {
    /// Merged data input.
    pub const IN: &str = "in";
    /// Merged system input, read with priority over data.
    pub const SYS_IN: &str = "sys-in";
    /// Primary data output.
    pub const OUT: &str = "out";
    /// System/control output.
    pub const SYS_OUT: &str = "sys-out";
}

/// Declarative port set of a processor, used for topology validation.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorSpec {
    /// Processor type name for logs and errors.
    pub name: &'static str,
    /// Inbound port names.
    pub ins: &'static [&'static str],
    /// Outbound port names.
    pub outs: &'static [&'static str],
}

/// Lifecycle events delivered by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Pause,
    Resume,
    Stop,
}

/// Graph lifecycle phase observed by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Built but not yet started.
    Paused,
    /// Scheduling transforms.
    Running,
    /// Terminal.
    Stopped,
}

/// Ordered frame emissions produced by one `transform` call.
#[derive(Debug, Default)]
pub struct Outputs {
    emissions: Vec<(&'static str, Frame)>,
}

impl Outputs {
    /// No emissions.
    pub fn none() -> Self {
        Self::default()
    }

    /// A single emission.
    pub fn single(port: &'static str, frame: Frame) -> Self {
        Self {
            emissions: vec![(port, frame)],
        }
    }

    /// Append an emission, preserving order.
    pub fn emit(&mut self, port: &'static str, frame: Frame) {
        self.emissions.push((port, frame));
    }

    /// Whether nothing will be emitted.
    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty()
    }

    /// The emissions in order.
    pub fn into_vec(self) -> Vec<(&'static str, Frame)> {
        self.emissions
    }
}

/// Private channels a processor hands to the runtime at wiring time.
///
/// `background_in` receivers are polled by the worker loop alongside the
/// external data port; `internal_out` senders receive emissions addressed to
/// the named private out-ports (e.g. a pacer's `audio-write`).
#[derive(Default)]
pub struct ProcessorIo {
    /// Private in-ports fed by background workers.
    pub background_in: Vec<(&'static str, mpsc::Receiver<Frame>)>,
    /// Private out-ports consumed by background workers.
    pub internal_out: Vec<(&'static str, mpsc::Sender<Frame>)>,
}

/// A node in the dataflow graph.
pub trait Processor: Send {
    /// Declarative port set.
    fn describe(&self) -> ProcessorSpec;

    /// Hand private channels to the runtime. Called exactly once, before
    /// the worker loop starts.
    fn take_io(&mut self) -> ProcessorIo {
        ProcessorIo::default()
    }

    /// Lifecycle transition. `Stop` must cancel background workers and
    /// release external resources.
    fn transition(&mut self, event: LifecycleEvent) -> Result<()>;

    /// Transform one inbound frame into ordered emissions. Must not block.
    fn transform(&mut self, port: &str, frame: Frame) -> Result<Outputs>;
}

/// Everything a spawned worker needs to run one processor.
pub(crate) struct NodeRuntime {
    pub id: String,
    pub processor: Box<dyn Processor>,
    pub sys_rx: mpsc::Receiver<Frame>,
    pub data_rx: mpsc::Receiver<Frame>,
    pub outs: HashMap<String, Vec<mpsc::Sender<Frame>>>,
    pub phase_rx: watch::Receiver<LifecyclePhase>,
    pub reports: ObservabilitySender<ReportEvent>,
    pub errors: ObservabilitySender<ErrorEvent>,
}

/// Run one processor until the graph stops or its channels close.
///
/// The loop reads the system channel with strict priority over data and
/// private ports, applies `transform`, and dispatches emissions onto every
/// channel wired to the named out-port. A failing `transform` is logged and
/// reported; the loop continues with state preserved.
pub(crate) async fn run_node(rt: NodeRuntime) {
    let NodeRuntime {
        id,
        mut processor,
        mut sys_rx,
        mut data_rx,
        mut outs,
        mut phase_rx,
        reports,
        errors,
    } = rt;

    let io = processor.take_io();
    let mut privates: StreamMap<&'static str, ReceiverStream<Frame>> = StreamMap::new();
    for (name, rx) in io.background_in {
        privates.insert(name, ReceiverStream::new(rx));
    }
    for (name, tx) in io.internal_out {
        outs.entry(name.to_owned()).or_default().push(tx);
    }

    let mut phase = *phase_rx.borrow();
    debug!(node = %id, "worker started");

    loop {
        let paused = phase != LifecyclePhase::Running;

        tokio::select! {
            biased;

            maybe = sys_rx.recv() => {
                let Some(frame) = maybe else {
                    debug!(node = %id, "system channel closed");
                    break;
                };
                match frame.kind() {
                    FrameKind::SystemStart => {
                        apply_transition(&mut *processor, &id, LifecycleEvent::Start, &errors);
                    }
                    FrameKind::SystemStop => {
                        apply_transition(&mut *processor, &id, LifecycleEvent::Stop, &errors);
                        break;
                    }
                    _ => {
                        step(&mut *processor, &id, port::SYS_IN, frame, &outs, &errors).await;
                    }
                }
            }

            changed = phase_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *phase_rx.borrow();
                match (phase, next) {
                    (LifecyclePhase::Running, LifecyclePhase::Paused) => {
                        apply_transition(&mut *processor, &id, LifecycleEvent::Pause, &errors);
                    }
                    (LifecyclePhase::Paused, LifecyclePhase::Running) => {
                        apply_transition(&mut *processor, &id, LifecycleEvent::Resume, &errors);
                    }
                    _ => {}
                }
                if next == LifecyclePhase::Stopped {
                    apply_transition(&mut *processor, &id, LifecycleEvent::Stop, &errors);
                    break;
                }
                phase = next;
            }

            Some((name, frame)) = privates.next(), if !paused => {
                step(&mut *processor, &id, name, frame, &outs, &errors).await;
            }

            maybe = data_rx.recv(), if !paused => {
                let Some(frame) = maybe else {
                    debug!(node = %id, "data channel closed");
                    break;
                };
                step(&mut *processor, &id, port::IN, frame, &outs, &errors).await;
            }
        }
    }

    reports.publish(ReportEvent {
        node: id.clone(),
        message: "worker exited".to_owned(),
        ts: monotonic_ms(),
    });
    info!(node = %id, "worker exited");
}

fn apply_transition(
    processor: &mut dyn Processor,
    node: &str,
    event: LifecycleEvent,
    errors: &ObservabilitySender<ErrorEvent>,
) {
    if let Err(e) = processor.transition(event) {
        error!(node, ?event, "transition failed: {e}");
        errors.publish(ErrorEvent {
            node: node.to_owned(),
            error: format!("transition {event:?}: {e}"),
            ts: monotonic_ms(),
        });
    }
}

async fn step(
    processor: &mut dyn Processor,
    node: &str,
    in_port: &str,
    frame: Frame,
    outs: &HashMap<String, Vec<mpsc::Sender<Frame>>>,
    errors: &ObservabilitySender<ErrorEvent>,
) {
    let kind = frame.kind();
    match processor.transform(in_port, frame) {
        Ok(outputs) => {
            for (out_port, frame) in outputs.into_vec() {
                let Some(targets) = outs.get(out_port) else {
                    // Unwired out-port: fan-out of zero.
                    continue;
                };
                for tx in targets {
                    if tx.send(frame.clone()).await.is_err() {
                        debug!(node, out_port, "downstream channel closed");
                    }
                }
            }
        }
        Err(e) => {
            // One faulty frame never kills the processor.
            warn!(node, %kind, in_port, "transform failed: {e}");
            errors.publish(ErrorEvent {
                node: node.to_owned(),
                error: format!("transform on {in_port} ({kind}): {e}"),
                ts: monotonic_ms(),
            });
        }
    }
}
