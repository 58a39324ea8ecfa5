//! Per-processor configuration.
//!
//! Every processor validates its config during construction and fails with
//! a [`FlowError::Config`](crate::error::FlowError) naming the offending
//! key. Configs that can come from files deserialize with
//! `deny_unknown_fields`, so unrecognized keys are rejected rather than
//! silently ignored.

use crate::context::LlmContext;
use crate::error::{FlowError, Result};
use crate::transport::OutboundMessage;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Context aggregator options.
#[derive(Debug, Clone, Default)]
pub struct ContextAggregatorConfig {
    /// Initial conversation context.
    pub context: LlmContext,
    /// Log every state transition.
    pub debug: bool,
}

/// Assistant assembler options.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AssistantAssemblerConfig {
    /// Log every reassembly step.
    pub debug: bool,
}

fn default_completions_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_owned()
}

/// Streaming LLM processor options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Model identifier sent in requests.
    pub model: String,
    /// Bearer token for the provider.
    pub api_key: String,
    /// Chat-completions endpoint.
    #[serde(default = "default_completions_url")]
    pub completions_url: String,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Completion token cap.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling parameter.
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Deterministic sampling seed.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Presence penalty.
    #[serde(default)]
    pub presence_penalty: Option<f32>,
}

impl LlmConfig {
    /// A config with only the required fields set.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            completions_url: default_completions_url(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            seed: None,
            presence_penalty: None,
        }
    }

    /// Override the completions endpoint (local servers, proxies, tests).
    pub fn with_completions_url(mut self, url: impl Into<String>) -> Self {
        self.completions_url = url.into();
        self
    }

    /// # Errors
    ///
    /// Returns [`FlowError::Config`] naming the missing key.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(FlowError::Config("llm: 'model' must not be empty".into()));
        }
        if self.api_key.is_empty() {
            return Err(FlowError::Config("llm: 'api_key' must not be empty".into()));
        }
        if self.completions_url.is_empty() {
            return Err(FlowError::Config(
                "llm: 'completions_url' must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Audio splitter options: a direct chunk size, or the audio format the
/// size is derived from.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AudioSplitterConfig {
    /// Chunk size in bytes. Mutually exclusive with the format fields.
    pub chunk_size: Option<usize>,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Bits per sample.
    pub sample_size_bits: Option<u16>,
    /// Interleaved channel count.
    pub channels: Option<u16>,
    /// Duration of one chunk in milliseconds.
    pub duration_ms: Option<u32>,
}

impl AudioSplitterConfig {
    /// A config with an explicit chunk size.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    /// A config deriving the chunk size from the audio format.
    pub fn with_format(
        sample_rate: u32,
        sample_size_bits: u16,
        channels: u16,
        duration_ms: u32,
    ) -> Self {
        Self {
            chunk_size: None,
            sample_rate: Some(sample_rate),
            sample_size_bits: Some(sample_size_bits),
            channels: Some(channels),
            duration_ms: Some(duration_ms),
        }
    }

    fn has_format_fields(&self) -> bool {
        self.sample_rate.is_some()
            || self.sample_size_bits.is_some()
            || self.channels.is_some()
            || self.duration_ms.is_some()
    }

    /// Resolve the effective chunk size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`] when neither form is complete, both
    /// are given, or the resolved size is zero.
    pub fn resolve_chunk_size(&self) -> Result<usize> {
        if let Some(size) = self.chunk_size {
            if self.has_format_fields() {
                return Err(FlowError::Config(
                    "audio-splitter: 'chunk_size' and format fields are mutually exclusive".into(),
                ));
            }
            if size == 0 {
                return Err(FlowError::Config(
                    "audio-splitter: 'chunk_size' must be positive".into(),
                ));
            }
            return Ok(size);
        }

        match (
            self.sample_rate,
            self.sample_size_bits,
            self.channels,
            self.duration_ms,
        ) {
            (Some(rate), Some(bits), Some(channels), Some(ms)) => {
                let size =
                    rate as usize * channels as usize * (bits as usize / 8) * ms as usize / 1000;
                if size == 0 {
                    return Err(FlowError::Config(
                        "audio-splitter: derived chunk size is zero".into(),
                    ));
                }
                Ok(size)
            }
            _ => Err(FlowError::Config(
                "audio-splitter: set 'chunk_size' or all of 'sample_rate', \
                 'sample_size_bits', 'channels', 'duration_ms'"
                    .into(),
            )),
        }
    }
}

/// Realtime pacer options.
pub struct RealtimePacerConfig {
    /// External delivery channel for paced output.
    pub out_channel: mpsc::Sender<OutboundMessage>,
    /// Nominal duration of one audio chunk in milliseconds.
    pub duration_ms: u64,
    /// Whether `control.interrupt.start` flushes queued audio.
    pub supports_interrupt: bool,
}

impl RealtimePacerConfig {
    /// A config with the default 20 ms chunk duration and interrupts on.
    pub fn new(out_channel: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            out_channel,
            duration_ms: 20,
            supports_interrupt: true,
        }
    }

    /// # Errors
    ///
    /// Returns [`FlowError::Config`] when `duration_ms` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.duration_ms == 0 {
            return Err(FlowError::Config(
                "realtime-pacer: 'duration_ms' must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RealtimePacerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimePacerConfig")
            .field("duration_ms", &self.duration_ms)
            .field("supports_interrupt", &self.supports_interrupt)
            .finish()
    }
}

/// Barge-in mute strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MuteStrategy {
    /// Mute while the bot is speaking.
    BotSpeech,
    /// Mute only during the bot's first utterance.
    FirstSpeech,
    /// Mute while a tool call is outstanding.
    ToolCall,
}

/// Mute filter options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MuteFilterConfig {
    /// Enabled strategies; at least one required.
    pub strategies: Vec<MuteStrategy>,
}

impl MuteFilterConfig {
    pub fn new(strategies: Vec<MuteStrategy>) -> Self {
        Self { strategies }
    }

    /// # Errors
    ///
    /// Returns [`FlowError::Config`] when no strategy is enabled.
    pub fn validate(&self) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(FlowError::Config(
                "mute-filter: 'strategies' must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_min_clause_len() -> usize {
    20
}

/// Sentence assembler options.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SentenceAssemblerConfig {
    /// Minimum buffered length before splitting on clause punctuation.
    #[serde(default = "default_min_clause_len")]
    pub min_clause_len: usize,
}

impl Default for SentenceAssemblerConfig {
    fn default() -> Self {
        Self {
            min_clause_len: default_min_clause_len(),
        }
    }
}

fn default_activity_timeout_ms() -> u64 {
    5000
}

/// Activity monitor options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityMonitorConfig {
    /// Inactivity window in milliseconds before the prompt fires.
    #[serde(default = "default_activity_timeout_ms")]
    pub timeout_ms: u64,
    /// Synthetic user message injected after the window elapses.
    pub prompt: String,
}

impl ActivityMonitorConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            timeout_ms: default_activity_timeout_ms(),
            prompt: prompt.into(),
        }
    }

    /// # Errors
    ///
    /// Returns [`FlowError::Config`] on an empty prompt or zero window.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(FlowError::Config(
                "activity-monitor: 'timeout_ms' must be positive".into(),
            ));
        }
        if self.prompt.is_empty() {
            return Err(FlowError::Config(
                "activity-monitor: 'prompt' must not be empty".into(),
            ));
        }
        Ok(())
    }
}
