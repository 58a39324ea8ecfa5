//! Barge-in policy: when to stop listening to the user.
//!
//! Each enabled strategy contributes a latch that is set and cleared by
//! matching frame edges. The filter emits `mute.input.start` on `sys-out`
//! the moment any latch becomes active and `mute.input.stop` only once
//! every latch has cleared, so overlapping strategies mute exactly once.

use crate::config::{MuteFilterConfig, MuteStrategy};
use crate::error::Result;
use crate::frame::{Frame, FrameKind, FramePayload};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorSpec, port};
use std::collections::HashSet;
use tracing::debug;

/// Enforces the configured barge-in mute strategies.
pub struct MuteFilter {
    strategies: HashSet<MuteStrategy>,
    latches: HashSet<MuteStrategy>,
    muted: bool,
    first_speech_started: bool,
    first_speech_ended: bool,
}

impl MuteFilter {
    /// Create a mute filter.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`](crate::error::FlowError) when no
    /// strategy is enabled.
    pub fn new(config: MuteFilterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            strategies: config.strategies.into_iter().collect(),
            latches: HashSet::new(),
            muted: false,
            first_speech_started: false,
            first_speech_ended: false,
        })
    }

    /// Whether input is currently muted.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn update_latches(&mut self, kind: FrameKind) {
        match kind {
            FrameKind::BotSpeechStart => {
                if self.strategies.contains(&MuteStrategy::BotSpeech) {
                    self.latches.insert(MuteStrategy::BotSpeech);
                }
                if self.strategies.contains(&MuteStrategy::FirstSpeech)
                    && !self.first_speech_ended
                {
                    self.first_speech_started = true;
                    self.latches.insert(MuteStrategy::FirstSpeech);
                }
            }
            FrameKind::BotSpeechStop => {
                self.latches.remove(&MuteStrategy::BotSpeech);
                if self.latches.remove(&MuteStrategy::FirstSpeech) {
                    self.first_speech_ended = true;
                }
            }
            FrameKind::LlmToolCallRequest => {
                if self.strategies.contains(&MuteStrategy::ToolCall) {
                    self.latches.insert(MuteStrategy::ToolCall);
                }
            }
            FrameKind::LlmToolCallResult => {
                self.latches.remove(&MuteStrategy::ToolCall);
            }
            _ => {}
        }
    }
}

impl Processor for MuteFilter {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "mute-filter",
            ins: &[port::IN, port::SYS_IN],
            outs: &[port::OUT, port::SYS_OUT],
        }
    }

    fn transition(&mut self, _event: LifecycleEvent) -> Result<()> {
        Ok(())
    }

    fn transform(&mut self, _port: &str, frame: Frame) -> Result<Outputs> {
        self.update_latches(frame.kind());

        let mut outputs = Outputs::none();
        let should_mute = !self.latches.is_empty();
        if should_mute && !self.muted {
            self.muted = true;
            debug!("muting user input");
            outputs.emit(port::SYS_OUT, Frame::new(FramePayload::MuteInputStart));
        } else if !should_mute && self.muted {
            self.muted = false;
            debug!("unmuting user input");
            outputs.emit(port::SYS_OUT, Frame::new(FramePayload::MuteInputStop));
        }

        outputs.emit(port::OUT, frame);
        Ok(outputs)
    }
}
