//! Reassembles a streaming LLM response into one context append.
//!
//! Between `llm.full.response.start` and `llm.full.response.end` the
//! assembler accumulates text chunks and tool-call fragments. On the end
//! frame it emits at most one `llm.context.messages.append`: a tool-call
//! request wins over plain text, and an empty response emits nothing.
//! Argument fragments are concatenated as opaque strings — they may split
//! inside JSON string literals, so nothing is parsed here.

use crate::config::AssistantAssemblerConfig;
use crate::context::{Content, ContentPart, Message, Role, ToolCall};
use crate::error::Result;
use crate::frame::{ContextAppend, Frame, FramePayload};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorSpec, port};
use tracing::debug;

/// Collects one streamed assistant response into a single message.
pub struct AssistantAssembler {
    debug: bool,
    content_aggregation: Option<String>,
    function_name: Option<String>,
    function_arguments: Option<String>,
    tool_call_id: Option<String>,
}

impl AssistantAssembler {
    pub fn new(config: AssistantAssemblerConfig) -> Self {
        Self {
            debug: config.debug,
            content_aggregation: None,
            function_name: None,
            function_arguments: None,
            tool_call_id: None,
        }
    }

    fn reset(&mut self) {
        self.content_aggregation = None;
        self.function_name = None;
        self.function_arguments = None;
        self.tool_call_id = None;
    }

    /// Build the append frame for the completed response, if any.
    fn finish(&mut self) -> Option<Frame> {
        let append = if let Some(call_id) = self.tool_call_id.take() {
            let call = ToolCall::function(
                call_id,
                self.function_name.take().unwrap_or_default(),
                self.function_arguments.take().unwrap_or_else(|| "{}".into()),
            );
            Some(ContextAppend {
                messages: vec![Message::assistant_tool_calls(vec![call])],
                tool_call: true,
                run_llm: false,
            })
        } else if let Some(text) = self.content_aggregation.take()
            && !text.is_empty()
        {
            Some(ContextAppend {
                messages: vec![Message {
                    role: Role::Assistant,
                    content: Content::Parts(vec![ContentPart::Text { text }]),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                }],
                tool_call: false,
                run_llm: false,
            })
        } else {
            None
        };
        self.reset();
        append.map(|a| Frame::new(FramePayload::LlmContextMessagesAppend(a)))
    }
}

impl Processor for AssistantAssembler {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "assistant-assembler",
            ins: &[port::IN, port::SYS_IN],
            outs: &[port::OUT],
        }
    }

    fn transition(&mut self, _event: LifecycleEvent) -> Result<()> {
        Ok(())
    }

    fn transform(&mut self, _port: &str, frame: Frame) -> Result<Outputs> {
        match frame.payload {
            FramePayload::LlmFullResponseStart => {
                self.reset();
                Ok(Outputs::none())
            }
            FramePayload::LlmTextChunk(text) => {
                self.content_aggregation
                    .get_or_insert_with(String::new)
                    .push_str(&text);
                Ok(Outputs::none())
            }
            FramePayload::LlmToolCallChunk(chunk) => {
                if let Some(id) = chunk.id {
                    self.tool_call_id = Some(id);
                    self.function_name = chunk.function_name;
                }
                if let Some(fragment) = chunk.arguments_fragment {
                    self.function_arguments
                        .get_or_insert_with(String::new)
                        .push_str(&fragment);
                }
                Ok(Outputs::none())
            }
            FramePayload::LlmFullResponseEnd => {
                if self.debug {
                    debug!(
                        tool_call = self.tool_call_id.is_some(),
                        "assistant response complete"
                    );
                }
                match self.finish() {
                    Some(frame) => Ok(Outputs::single(port::OUT, frame)),
                    None => Ok(Outputs::none()),
                }
            }
            // Anything outside the streaming protocol flows through.
            _ => Ok(Outputs::single(port::OUT, frame)),
        }
    }
}
