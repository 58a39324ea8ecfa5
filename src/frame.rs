//! Frame types passed between processors.
//!
//! A [`Frame`] is the only value that flows on graph channels: a tagged,
//! immutable record stamped with a monotonic timestamp and a unique id at
//! construction. The payload enumeration is closed — every frame kind the
//! runtime understands is a variant here, and nothing else can appear on a
//! channel.

use crate::context::{LlmContext, Message, ToolDefinition};
use crate::transport::FrameSerializer;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use uuid::Uuid;

/// Milliseconds elapsed on the process-wide monotonic clock.
///
/// All frame timestamps come from this clock, so they are comparable across
/// processors but carry no wall-clock meaning.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// A transcription result from an STT stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcription {
    /// The transcribed text.
    pub text: String,
}

impl Transcription {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// One streamed fragment of an LLM tool call (`choices[0].delta.tool_calls[0]`).
///
/// The first chunk of a call carries `id` and `function_name`; later chunks
/// carry only argument fragments. `arguments_fragment` is an opaque slice of
/// a JSON document and may split anywhere, including inside string literals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallChunk {
    /// Tool call id, present on the first chunk of a call.
    pub id: Option<String>,
    /// Function name, present on the first chunk of a call.
    pub function_name: Option<String>,
    /// A fragment of the JSON arguments string.
    pub arguments_fragment: Option<String>,
}

/// A fully reassembled tool invocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    /// The unique call id from the LLM.
    pub call_id: String,
    /// The function name being called.
    pub function_name: String,
    /// The full JSON arguments string, unparsed.
    pub arguments: String,
}

/// The outcome of running a tool, paired with the request that produced it.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    /// The originating request, so consumers can append it if absent.
    pub request: ToolCallRequest,
    /// The handler's result (or an error object).
    pub result: serde_json::Value,
    /// Whether the updated context should be sent back to the LLM.
    pub run_llm: bool,
}

/// Messages to append to the LLM context, with routing properties.
#[derive(Debug, Clone)]
pub struct ContextAppend {
    /// Messages to append, in order.
    pub messages: Vec<Message>,
    /// Route to the tool-execution path.
    pub tool_call: bool,
    /// Emit the updated context to drive the LLM.
    pub run_llm: bool,
}

/// Wholesale context replacement from a scenario controller.
#[derive(Debug, Clone)]
pub struct ContextUpdate {
    /// The new message history.
    pub messages: Vec<Message>,
    /// The new tool set.
    pub tools: Vec<ToolDefinition>,
    /// Emit the replaced context to drive the LLM.
    pub run_llm: bool,
}

/// Text the bot should speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakText {
    /// The utterance text.
    pub text: String,
}

impl SpeakText {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Raw audio format parameters announced by an upstream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Bits per sample.
    pub sample_size_bits: u16,
}

/// Payload of a `system.config.change` frame.
///
/// Each field is optional; a change frame installs only what it carries.
#[derive(Clone, Default)]
pub struct ConfigDelta {
    /// New raw audio format for downstream audio stages.
    pub audio_format: Option<AudioFormat>,
    /// Per-transport output serializer for the realtime pacer.
    pub serializer: Option<Arc<dyn FrameSerializer>>,
    /// Replacement LLM context for the aggregator.
    pub llm_context: Option<LlmContext>,
}

impl std::fmt::Debug for ConfigDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDelta")
            .field("audio_format", &self.audio_format)
            .field("serializer", &self.serializer.as_ref().map(|_| "<dyn>"))
            .field("llm_context", &self.llm_context)
            .finish()
    }
}

/// The closed set of frame payloads.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Raw audio bytes from an input transport.
    AudioInputRaw(Bytes),
    /// Raw audio bytes destined for an output transport.
    AudioOutputRaw(Bytes),

    /// The user started speaking.
    UserSpeechStart,
    /// The user stopped speaking.
    UserSpeechStop,
    /// The bot started speaking.
    BotSpeechStart,
    /// The bot stopped speaking.
    BotSpeechStop,

    /// A partial STT hypothesis, not yet finalized.
    TranscriptionInterim(Transcription),
    /// A final STT transcription.
    TranscriptionFinal(Transcription),

    /// A full LLM context, ready to drive a completion request.
    LlmContext(LlmContext),
    /// Messages to append to the context, with routing properties.
    LlmContextMessagesAppend(ContextAppend),
    /// One streamed text fragment of an LLM response.
    LlmTextChunk(String),
    /// One streamed tool-call fragment of an LLM response.
    LlmToolCallChunk(ToolCallChunk),
    /// A reassembled tool invocation request.
    LlmToolCallRequest(ToolCallRequest),
    /// The result of running a tool.
    LlmToolCallResult(ToolCallResult),
    /// The LLM response stream opened.
    LlmFullResponseStart,
    /// The LLM response stream completed normally.
    LlmFullResponseEnd,

    /// Text the bot should synthesize and speak.
    Speak(SpeakText),

    /// In-band cancellation: abandon in-flight generation and queued audio.
    ControlInterruptStart,
    /// In-band resumption after an interrupt.
    ControlInterruptStop,
    /// Upstream input should be discarded until further notice.
    MuteInputStart,
    /// Upstream input flows again.
    MuteInputStop,

    /// Graph lifecycle: processors begin work.
    SystemStart,
    /// Graph lifecycle: processors release resources and exit.
    SystemStop,
    /// Runtime reconfiguration (audio format, serializer, context swap).
    SystemConfigChange(ConfigDelta),
    /// A recoverable fault surfaced in-band.
    SystemError(String),

    /// Scenario-driven context replacement.
    ScenarioContextUpdate(ContextUpdate),
}

/// Fieldless mirror of [`FramePayload`] for predicates and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    AudioInputRaw,
    AudioOutputRaw,
    UserSpeechStart,
    UserSpeechStop,
    BotSpeechStart,
    BotSpeechStop,
    TranscriptionInterim,
    TranscriptionFinal,
    LlmContext,
    LlmContextMessagesAppend,
    LlmTextChunk,
    LlmToolCallChunk,
    LlmToolCallRequest,
    LlmToolCallResult,
    LlmFullResponseStart,
    LlmFullResponseEnd,
    Speak,
    ControlInterruptStart,
    ControlInterruptStop,
    MuteInputStart,
    MuteInputStop,
    SystemStart,
    SystemStop,
    SystemConfigChange,
    SystemError,
    ScenarioContextUpdate,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AudioInputRaw => "audio.input.raw",
            Self::AudioOutputRaw => "audio.output.raw",
            Self::UserSpeechStart => "user.speech.start",
            Self::UserSpeechStop => "user.speech.stop",
            Self::BotSpeechStart => "bot.speech.start",
            Self::BotSpeechStop => "bot.speech.stop",
            Self::TranscriptionInterim => "transcription.interim",
            Self::TranscriptionFinal => "transcription",
            Self::LlmContext => "llm.context",
            Self::LlmContextMessagesAppend => "llm.context.messages.append",
            Self::LlmTextChunk => "llm.text.chunk",
            Self::LlmToolCallChunk => "llm.tool.call.chunk",
            Self::LlmToolCallRequest => "llm.tool.call.request",
            Self::LlmToolCallResult => "llm.tool.call.result",
            Self::LlmFullResponseStart => "llm.full.response.start",
            Self::LlmFullResponseEnd => "llm.full.response.end",
            Self::Speak => "speak.frame",
            Self::ControlInterruptStart => "control.interrupt.start",
            Self::ControlInterruptStop => "control.interrupt.stop",
            Self::MuteInputStart => "mute.input.start",
            Self::MuteInputStop => "mute.input.stop",
            Self::SystemStart => "system.start",
            Self::SystemStop => "system.stop",
            Self::SystemConfigChange => "system.config.change",
            Self::SystemError => "system.error",
            Self::ScenarioContextUpdate => "scenario.context.update",
        };
        write!(f, "{name}")
    }
}

/// An immutable record flowing on graph channels.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Unique frame identifier.
    pub id: Uuid,
    /// Monotonic creation timestamp in milliseconds.
    pub ts: u64,
    /// The typed payload.
    pub payload: FramePayload,
}

impl Frame {
    /// Construct a frame, stamping `ts` and `id`.
    pub fn new(payload: FramePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: monotonic_ms(),
            payload,
        }
    }

    /// The fieldless kind tag of this frame.
    pub fn kind(&self) -> FrameKind {
        match &self.payload {
            FramePayload::AudioInputRaw(_) => FrameKind::AudioInputRaw,
            FramePayload::AudioOutputRaw(_) => FrameKind::AudioOutputRaw,
            FramePayload::UserSpeechStart => FrameKind::UserSpeechStart,
            FramePayload::UserSpeechStop => FrameKind::UserSpeechStop,
            FramePayload::BotSpeechStart => FrameKind::BotSpeechStart,
            FramePayload::BotSpeechStop => FrameKind::BotSpeechStop,
            FramePayload::TranscriptionInterim(_) => FrameKind::TranscriptionInterim,
            FramePayload::TranscriptionFinal(_) => FrameKind::TranscriptionFinal,
            FramePayload::LlmContext(_) => FrameKind::LlmContext,
            FramePayload::LlmContextMessagesAppend(_) => FrameKind::LlmContextMessagesAppend,
            FramePayload::LlmTextChunk(_) => FrameKind::LlmTextChunk,
            FramePayload::LlmToolCallChunk(_) => FrameKind::LlmToolCallChunk,
            FramePayload::LlmToolCallRequest(_) => FrameKind::LlmToolCallRequest,
            FramePayload::LlmToolCallResult(_) => FrameKind::LlmToolCallResult,
            FramePayload::LlmFullResponseStart => FrameKind::LlmFullResponseStart,
            FramePayload::LlmFullResponseEnd => FrameKind::LlmFullResponseEnd,
            FramePayload::Speak(_) => FrameKind::Speak,
            FramePayload::ControlInterruptStart => FrameKind::ControlInterruptStart,
            FramePayload::ControlInterruptStop => FrameKind::ControlInterruptStop,
            FramePayload::MuteInputStart => FrameKind::MuteInputStart,
            FramePayload::MuteInputStop => FrameKind::MuteInputStop,
            FramePayload::SystemStart => FrameKind::SystemStart,
            FramePayload::SystemStop => FrameKind::SystemStop,
            FramePayload::SystemConfigChange(_) => FrameKind::SystemConfigChange,
            FramePayload::SystemError(_) => FrameKind::SystemError,
            FramePayload::ScenarioContextUpdate(_) => FrameKind::ScenarioContextUpdate,
        }
    }

    /// Whether this is a lifecycle/control frame that preempts data frames.
    pub fn is_system(&self) -> bool {
        matches!(
            self.payload,
            FramePayload::SystemStart
                | FramePayload::SystemStop
                | FramePayload::SystemConfigChange(_)
                | FramePayload::SystemError(_)
        )
    }
}
