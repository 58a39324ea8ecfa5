//! Simulflow: real-time voice-agent dataflow runtime.
//!
//! Voice agents are built by composing independent processors into a
//! directed graph that exchanges typed frames:
//! transport-in → transcriptor → context-aggregator → llm →
//! {assistant-assembler → context-aggregator ;
//!  sentence-assembler → tts → audio-splitter → realtime-out}
//!
//! # Architecture
//!
//! - **Frames** are immutable tagged records, the only values on channels
//! - **Processors** are state machines behind a uniform contract
//!   (`describe` / construction / `transition` / `transform`); blocking
//!   work lives in background workers feeding private ports
//! - **The graph engine** validates topology, wires bounded channels,
//!   runs one worker per processor, and reads system traffic with strict
//!   priority over data
//! - **Barge-in** flows in-band: `control.interrupt.start` cancels the
//!   LLM stream, flushes paced audio, and the mute filter gates input

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod graph;
pub mod processor;
pub mod processors;
pub mod transport;

pub use channel::{ErrorEvent, ReportEvent};
pub use config::{
    ActivityMonitorConfig, AssistantAssemblerConfig, AudioSplitterConfig, ContextAggregatorConfig,
    LlmConfig, MuteFilterConfig, MuteStrategy, RealtimePacerConfig, SentenceAssemblerConfig,
};
pub use context::{Content, ContentPart, LlmContext, Message, Role, ToolCall, ToolDefinition, ToolHandler};
pub use error::{FlowError, Result};
pub use frame::{Frame, FrameKind, FramePayload};
pub use graph::{Graph, GraphBuilder};
pub use processor::{LifecycleEvent, Outputs, Processor, ProcessorIo, ProcessorSpec, port};
pub use transport::{FrameSerializer, OutboundMessage};
