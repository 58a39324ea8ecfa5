//! Fixed-size chunking of output audio.
//!
//! Downstream pacers deliver one chunk per tick, so the splitter re-emits
//! each `audio.output.raw` frame as consecutive `chunk_size` slices with the
//! remainder last. Byte content and order are preserved; everything else
//! passes through unchanged.

use crate::config::AudioSplitterConfig;
use crate::error::Result;
use crate::frame::{Frame, FramePayload};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorSpec, port};
use tracing::debug;

/// Splits output audio frames into fixed-size chunks.
pub struct AudioSplitter {
    config: AudioSplitterConfig,
    chunk_size: usize,
}

impl AudioSplitter {
    /// Create a splitter, resolving the chunk size from the config.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`](crate::error::FlowError) when the
    /// config resolves to no usable chunk size.
    pub fn new(config: AudioSplitterConfig) -> Result<Self> {
        let chunk_size = config.resolve_chunk_size()?;
        Ok(Self { config, chunk_size })
    }

    /// The effective chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Processor for AudioSplitter {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "audio-splitter",
            ins: &[port::IN, port::SYS_IN],
            outs: &[port::OUT],
        }
    }

    fn transition(&mut self, _event: LifecycleEvent) -> Result<()> {
        Ok(())
    }

    fn transform(&mut self, _port: &str, frame: Frame) -> Result<Outputs> {
        match &frame.payload {
            FramePayload::AudioOutputRaw(bytes) => {
                let mut outputs = Outputs::none();
                let mut offset = 0;
                while offset < bytes.len() {
                    let end = (offset + self.chunk_size).min(bytes.len());
                    outputs.emit(
                        port::OUT,
                        Frame::new(FramePayload::AudioOutputRaw(bytes.slice(offset..end))),
                    );
                    offset = end;
                }
                Ok(outputs)
            }
            FramePayload::SystemConfigChange(delta) => {
                // A format announcement retunes a format-derived chunk size;
                // an explicit chunk_size config is left alone.
                if let Some(format) = delta.audio_format
                    && self.config.chunk_size.is_none()
                {
                    self.config.sample_rate = Some(format.sample_rate);
                    self.config.channels = Some(format.channels);
                    self.config.sample_size_bits = Some(format.sample_size_bits);
                    if let Ok(size) = self.config.resolve_chunk_size() {
                        debug!(chunk_size = size, "audio splitter retuned");
                        self.chunk_size = size;
                    }
                }
                Ok(Outputs::single(port::OUT, frame))
            }
            _ => Ok(Outputs::single(port::OUT, frame)),
        }
    }
}
