//! Transport-facing types: output serialization and wire codecs.
//!
//! A transport is an external collaborator; the core only specifies the
//! frame-level contract. Serializers are installed at runtime through
//! `system.config.change` frames so one pacer can feed any transport.

pub mod twilio;

use crate::error::Result;
use crate::frame::Frame;

/// Encodes frames into a transport's wire format.
///
/// Installed on the realtime pacer via a `system.config.change` frame; the
/// pacer applies it to each audio frame just before delivery.
pub trait FrameSerializer: Send + Sync {
    /// Encode one frame as wire text.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Transport`](crate::error::FlowError) for frame
    /// kinds this transport cannot carry.
    fn serialize(&self, frame: &Frame) -> Result<String>;
}

/// A paced delivery to the external output channel.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// An unserialized frame (no serializer installed).
    Raw(Frame),
    /// Wire text produced by the installed serializer.
    Serialized(String),
}
