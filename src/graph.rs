//! Graph engine: topology validation, channel wiring, and lifecycle.
//!
//! A graph is built from named processors and directed edges between their
//! ports. Building validates the topology, allocates one bounded channel
//! pair per node (merged `sys-in` with priority, merged `in` for data), and
//! spawns one worker per processor. Fan-in is multiple senders on one
//! channel; fan-out is one send per wired target in edge order.

use crate::channel::{ErrorEvent, ObservabilitySender, ReportEvent, data_channel, system_channel};
use crate::error::{FlowError, Result};
use crate::frame::{Frame, FramePayload};
use crate::processor::{LifecyclePhase, NodeRuntime, Processor, port, run_node};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long `stop` waits for each worker before abandoning it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct EdgeSpec {
    from_node: String,
    from_port: String,
    to_node: String,
    to_port: String,
}

/// Assembles processors and edges into a runnable [`Graph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<(String, Box<dyn Processor>)>,
    edges: Vec<EdgeSpec>,
    taps: Vec<(String, String, mpsc::Sender<Frame>)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named processor node.
    pub fn add_node(&mut self, id: impl Into<String>, processor: Box<dyn Processor>) {
        self.nodes.push((id.into(), processor));
    }

    /// Connect `(from_node, from_port)` to `(to_node, to_port)`.
    ///
    /// The same source port may fan out to several targets; the same target
    /// may fan in from several sources. Validated at [`build`](Self::build).
    pub fn connect(
        &mut self,
        from: (impl Into<String>, impl Into<String>),
        to: (impl Into<String>, impl Into<String>),
    ) {
        self.edges.push(EdgeSpec {
            from_node: from.0.into(),
            from_port: from.1.into(),
            to_node: to.0.into(),
            to_port: to.1.into(),
        });
    }

    /// Tap a node's out-port from outside the graph.
    ///
    /// Returns the receiving end of a dedicated bounded channel that is
    /// wired like any other edge target.
    pub fn external_output(
        &mut self,
        node: impl Into<String>,
        from_port: impl Into<String>,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = data_channel();
        self.taps.push((node.into(), from_port.into(), tx));
        rx
    }

    /// Validate the topology, wire channels, and spawn one worker per node.
    ///
    /// The graph starts in the paused phase; call [`Graph::start`] to run.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Graph`] naming the offending node, port, or
    /// duplicate id.
    pub fn build(self) -> Result<Graph> {
        let mut specs: HashMap<String, crate::processor::ProcessorSpec> = HashMap::new();
        for (id, processor) in &self.nodes {
            if specs.insert(id.clone(), processor.describe()).is_some() {
                return Err(FlowError::Graph(format!("duplicate node id '{id}'")));
            }
        }

        // Allocate per-node merged channels up front so edges can resolve
        // senders in any order.
        let mut sys_txs: HashMap<String, mpsc::Sender<Frame>> = HashMap::new();
        let mut data_txs: HashMap<String, mpsc::Sender<Frame>> = HashMap::new();
        let mut sys_rxs: HashMap<String, mpsc::Receiver<Frame>> = HashMap::new();
        let mut data_rxs: HashMap<String, mpsc::Receiver<Frame>> = HashMap::new();
        for (id, _) in &self.nodes {
            let (stx, srx) = system_channel();
            let (dtx, drx) = data_channel();
            sys_txs.insert(id.clone(), stx);
            data_txs.insert(id.clone(), dtx);
            sys_rxs.insert(id.clone(), srx);
            data_rxs.insert(id.clone(), drx);
        }

        let check_out = |node: &str, out_port: &str| -> Result<()> {
            let spec = specs
                .get(node)
                .ok_or_else(|| FlowError::Graph(format!("unknown node '{node}'")))?;
            if !spec.outs.iter().any(|p| *p == out_port) {
                return Err(FlowError::Graph(format!(
                    "node '{node}' ({}) has no out-port '{out_port}'",
                    spec.name
                )));
            }
            Ok(())
        };

        let mut outs: HashMap<String, HashMap<String, Vec<mpsc::Sender<Frame>>>> = HashMap::new();
        for (id, _) in &self.nodes {
            outs.insert(id.clone(), HashMap::new());
        }

        for edge in &self.edges {
            check_out(&edge.from_node, &edge.from_port)?;
            let to_spec = specs
                .get(&edge.to_node)
                .ok_or_else(|| FlowError::Graph(format!("unknown node '{}'", edge.to_node)))?;
            if !to_spec.ins.iter().any(|p| *p == edge.to_port) {
                return Err(FlowError::Graph(format!(
                    "node '{}' ({}) has no in-port '{}'",
                    edge.to_node, to_spec.name, edge.to_port
                )));
            }
            let target = match edge.to_port.as_str() {
                port::SYS_IN => &sys_txs[&edge.to_node],
                port::IN => &data_txs[&edge.to_node],
                other => {
                    return Err(FlowError::Graph(format!(
                        "edges may only target 'in' or 'sys-in', got '{other}' on node '{}'",
                        edge.to_node
                    )));
                }
            };
            if let Some(m) = outs.get_mut(&edge.from_node) {
                m.entry(edge.from_port.clone()).or_default().push(target.clone());
            }
        }

        for (node, from_port, tx) in self.taps {
            check_out(&node, &from_port)?;
            if let Some(m) = outs.get_mut(&node) {
                m.entry(from_port).or_default().push(tx);
            }
        }

        let (phase_tx, phase_rx) = watch::channel(LifecyclePhase::Paused);
        let reports: ObservabilitySender<ReportEvent> = ObservabilitySender::new();
        let errors: ObservabilitySender<ErrorEvent> = ObservabilitySender::new();

        let mut handles = Vec::with_capacity(self.nodes.len());
        for (id, processor) in self.nodes {
            let (Some(sys_rx), Some(data_rx)) = (sys_rxs.remove(&id), data_rxs.remove(&id))
            else {
                return Err(FlowError::Graph(format!(
                    "channels for node '{id}' were not allocated"
                )));
            };
            let rt = NodeRuntime {
                id: id.clone(),
                processor,
                sys_rx,
                data_rx,
                outs: outs.remove(&id).unwrap_or_default(),
                phase_rx: phase_rx.clone(),
                reports: reports.clone(),
                errors: errors.clone(),
            };
            let handle = tokio::spawn(run_node(rt));
            handles.push((id, handle));
        }

        info!(nodes = handles.len(), "graph built");
        Ok(Graph {
            sys_txs,
            data_txs,
            phase_tx,
            handles,
            reports,
            errors,
        })
    }
}

/// A wired, running set of processor workers.
///
/// Lifecycle: built (paused) → running → stopped; stop is terminal. All
/// handles to the graph are explicit — there are no process-wide singletons.
pub struct Graph {
    sys_txs: HashMap<String, mpsc::Sender<Frame>>,
    data_txs: HashMap<String, mpsc::Sender<Frame>>,
    phase_tx: watch::Sender<LifecyclePhase>,
    handles: Vec<(String, JoinHandle<()>)>,
    reports: ObservabilitySender<ReportEvent>,
    errors: ObservabilitySender<ErrorEvent>,
}

impl Graph {
    /// A sender into a node's merged data channel (fan-in with its edges).
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Graph`] for an unknown node.
    pub fn input(&self, node: &str) -> Result<mpsc::Sender<Frame>> {
        self.data_txs
            .get(node)
            .cloned()
            .ok_or_else(|| FlowError::Graph(format!("unknown node '{node}'")))
    }

    /// A sender into a node's merged system channel.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Graph`] for an unknown node.
    pub fn system_input(&self, node: &str) -> Result<mpsc::Sender<Frame>> {
        self.sys_txs
            .get(node)
            .cloned()
            .ok_or_else(|| FlowError::Graph(format!("unknown node '{node}'")))
    }

    /// Subscribe to out-of-band progress reports.
    pub fn reports(&self) -> broadcast::Receiver<ReportEvent> {
        self.reports.subscribe()
    }

    /// Subscribe to out-of-band error reports.
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Start scheduling transforms and deliver `system.start` to every node.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Graph`] if a node's system channel is gone.
    pub async fn start(&self) -> Result<()> {
        let _ = self.phase_tx.send(LifecyclePhase::Running);
        for (id, tx) in &self.sys_txs {
            if tx.send(Frame::new(FramePayload::SystemStart)).await.is_err() {
                return Err(FlowError::Graph(format!(
                    "node '{id}' is not accepting system frames"
                )));
            }
        }
        info!("graph started");
        Ok(())
    }

    /// Stop scheduling new transforms; channels and state are kept.
    pub fn pause(&self) {
        let _ = self.phase_tx.send(LifecyclePhase::Paused);
        info!("graph paused");
    }

    /// Resume scheduling after [`pause`](Self::pause).
    pub fn resume(&self) {
        let _ = self.phase_tx.send(LifecyclePhase::Running);
        info!("graph resumed");
    }

    /// Deliver `system.stop` to every node, run stop transitions, close
    /// inbound channels, and join workers with a bounded timeout.
    ///
    /// Workers that do not exit within the timeout are abandoned.
    pub async fn stop(mut self) {
        for (id, tx) in &self.sys_txs {
            if tx.send(Frame::new(FramePayload::SystemStop)).await.is_err() {
                warn!(node = %id, "system channel closed before stop");
            }
        }
        let _ = self.phase_tx.send(LifecyclePhase::Stopped);
        self.sys_txs.clear();
        self.data_txs.clear();

        for (id, handle) in self.handles.drain(..) {
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(node = %id, "worker panicked: {e}"),
                Err(_) => warn!(node = %id, "worker did not stop in time, abandoning"),
            }
        }
        info!("graph stopped");
    }
}
