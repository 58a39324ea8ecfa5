//! Twilio media-stream wire codec.
//!
//! Twilio streams call audio as JSON messages over a websocket. Inbound
//! messages decode to frames; outbound audio is wrapped back into `media`
//! messages by a stream-specific [`TwilioSerializer`] installed when the
//! `start` message arrives.

use super::FrameSerializer;
use crate::error::{FlowError, Result};
use crate::frame::{ConfigDelta, Frame, FramePayload};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Serializes `audio.output.raw` frames into Twilio `media` messages.
#[derive(Debug, Clone)]
pub struct TwilioSerializer {
    /// The stream this serializer belongs to.
    pub stream_sid: String,
}

impl TwilioSerializer {
    pub fn new(stream_sid: impl Into<String>) -> Self {
        Self {
            stream_sid: stream_sid.into(),
        }
    }
}

impl FrameSerializer for TwilioSerializer {
    fn serialize(&self, frame: &Frame) -> Result<String> {
        match &frame.payload {
            FramePayload::AudioOutputRaw(bytes) => {
                let message = serde_json::json!({
                    "event": "media",
                    "streamSid": self.stream_sid,
                    "media": { "payload": BASE64.encode(bytes) },
                });
                serde_json::to_string(&message)
                    .map_err(|e| FlowError::Transport(format!("media encode failed: {e}")))
            }
            _ => {
                debug!(kind = %frame.kind(), "unsupported frame for twilio serializer");
                Err(FlowError::Transport(format!(
                    "twilio serializer cannot carry {}",
                    frame.kind()
                )))
            }
        }
    }
}

/// Decode one inbound Twilio websocket message into frames.
///
/// - `start` installs a stream-specific serializer via `system.config.change`
/// - `media` becomes `audio.input.raw` with the payload base64-decoded
/// - `stop`/`close` becomes `system.stop`
/// - `connected` is a handshake no-op
///
/// # Errors
///
/// Returns [`FlowError::Protocol`] for malformed JSON, missing fields, or
/// unknown event types.
pub fn decode_event(text: &str) -> Result<Vec<Frame>> {
    let message: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FlowError::Protocol(format!("twilio message is not JSON: {e}")))?;

    let event = message["event"]
        .as_str()
        .ok_or_else(|| FlowError::Protocol("twilio message missing 'event'".into()))?;

    match event {
        "connected" => Ok(Vec::new()),
        "start" => {
            let stream_sid = message["streamSid"]
                .as_str()
                .or_else(|| message["start"]["streamSid"].as_str())
                .ok_or_else(|| FlowError::Protocol("twilio start missing 'streamSid'".into()))?;
            let delta = ConfigDelta {
                serializer: Some(Arc::new(TwilioSerializer::new(stream_sid))),
                ..ConfigDelta::default()
            };
            Ok(vec![Frame::new(FramePayload::SystemConfigChange(delta))])
        }
        "media" => {
            let payload = message["media"]["payload"]
                .as_str()
                .ok_or_else(|| FlowError::Protocol("twilio media missing 'payload'".into()))?;
            let bytes = BASE64
                .decode(payload)
                .map_err(|e| FlowError::Protocol(format!("twilio media payload: {e}")))?;
            Ok(vec![Frame::new(FramePayload::AudioInputRaw(Bytes::from(
                bytes,
            )))])
        }
        "stop" | "close" => Ok(vec![Frame::new(FramePayload::SystemStop)]),
        other => Err(FlowError::Protocol(format!(
            "unknown twilio event '{other}'"
        ))),
    }
}
