//! Streaming chat-completion processor.
//!
//! Consumes `llm.context` frames and turns each into one streaming request
//! against an OpenAI-compatible endpoint. The response stream is emitted as
//! `llm.full.response.start`, a sequence of text / tool-call chunks, and
//! `llm.full.response.end`.
//!
//! At most one request is in flight; contexts arriving while busy queue up
//! and start as each stream completes. `control.interrupt.start` cancels
//! the in-flight stream mid-response: the HTTP body is dropped, buffered
//! deltas of the cancelled request are discarded, and no synthetic end
//! frame is emitted — downstream observes the barge-in through the mute
//! and activity pipeline instead.

pub mod sse;

use crate::config::LlmConfig;
use crate::context::LlmContext;
use crate::error::Result;
use crate::frame::{Frame, FrameKind, FramePayload, ToolCallChunk};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorIo, ProcessorSpec, port};
use futures_util::StreamExt;
use sse::SseParser;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Private in-port fed by the streaming request task.
pub const LLM_READ: &str = "llm-read";

/// Capacity of the private stream channel.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Streams chat completions for incoming contexts.
pub struct LlmProcessor {
    config: LlmConfig,
    client: reqwest::Client,
    /// Contexts received while a request was in flight.
    pending: VecDeque<LlmContext>,
    /// Cancellation handle of the in-flight request, if any.
    in_flight: Option<CancellationToken>,
    /// The next `llm.full.response.start` belongs to a freshly spawned
    /// request and re-enables forwarding after a discard.
    awaiting_start: bool,
    /// Drop stream frames left over from a cancelled request.
    discard_stream: bool,
    stream_tx: mpsc::Sender<Frame>,
    stream_rx: Option<mpsc::Receiver<Frame>>,
    cancel_all: CancellationToken,
}

impl LlmProcessor {
    /// Create an LLM processor.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`](crate::error::FlowError) when required
    /// connection fields are missing.
    pub fn new(config: LlmConfig) -> Result<Self> {
        config.validate()?;
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            pending: VecDeque::new(),
            in_flight: None,
            awaiting_start: false,
            discard_stream: false,
            stream_tx,
            stream_rx: Some(stream_rx),
            cancel_all: CancellationToken::new(),
        })
    }

    /// Whether a request is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn start_request(&mut self, context: LlmContext) {
        let cancel = self.cancel_all.child_token();
        self.in_flight = Some(cancel.clone());
        self.awaiting_start = true;
        debug!(messages = context.messages.len(), "starting completion request");
        tokio::spawn(run_request(
            self.client.clone(),
            self.config.clone(),
            context,
            self.stream_tx.clone(),
            cancel,
        ));
    }

    fn on_interrupt(&mut self) {
        let Some(cancel) = self.in_flight.take() else {
            // Nothing in flight: the interrupt is a no-op.
            return;
        };
        cancel.cancel();
        self.discard_stream = true;
        self.awaiting_start = false;
        if !self.pending.is_empty() {
            debug!(dropped = self.pending.len(), "interrupt discards queued contexts");
            self.pending.clear();
        }
    }

    fn on_stream_frame(&mut self, frame: Frame) -> Outputs {
        match frame.kind() {
            FrameKind::LlmFullResponseStart => {
                if self.awaiting_start {
                    self.awaiting_start = false;
                    self.discard_stream = false;
                    Outputs::single(port::OUT, frame)
                } else if self.discard_stream {
                    Outputs::none()
                } else {
                    Outputs::single(port::OUT, frame)
                }
            }
            FrameKind::LlmFullResponseEnd | FrameKind::SystemError => {
                if self.discard_stream {
                    return Outputs::none();
                }
                self.in_flight = None;
                let outputs = Outputs::single(port::OUT, frame);
                if let Some(next) = self.pending.pop_front() {
                    self.start_request(next);
                }
                outputs
            }
            _ => {
                if self.discard_stream {
                    Outputs::none()
                } else {
                    Outputs::single(port::OUT, frame)
                }
            }
        }
    }
}

impl Processor for LlmProcessor {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "llm",
            ins: &[port::IN, port::SYS_IN, LLM_READ],
            outs: &[port::OUT],
        }
    }

    fn take_io(&mut self) -> ProcessorIo {
        let mut io = ProcessorIo::default();
        if let Some(rx) = self.stream_rx.take() {
            io.background_in.push((LLM_READ, rx));
        }
        io
    }

    fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        if event == LifecycleEvent::Stop {
            self.cancel_all.cancel();
        }
        Ok(())
    }

    fn transform(&mut self, in_port: &str, frame: Frame) -> Result<Outputs> {
        if in_port == LLM_READ {
            return Ok(self.on_stream_frame(frame));
        }

        match frame.payload {
            FramePayload::LlmContext(context) => {
                if self.in_flight.is_some() {
                    debug!("request in flight, queueing context");
                    self.pending.push_back(context);
                } else {
                    self.start_request(context);
                }
                Ok(Outputs::none())
            }
            FramePayload::ControlInterruptStart => {
                self.on_interrupt();
                Ok(Outputs::none())
            }
            FramePayload::ControlInterruptStop => Ok(Outputs::none()),
            _ => {
                debug!(kind = %frame.kind(), "llm processor ignoring frame");
                Ok(Outputs::none())
            }
        }
    }
}

/// Build the provider request body. Tools go through the wire projection,
/// so handlers never leave the process.
fn request_body(config: &LlmConfig, context: &LlmContext) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": config.model,
        "messages": context.wire_messages(),
        "stream": true,
    });
    if !context.tools.is_empty() {
        body["tools"] = serde_json::Value::Array(context.wire_tools());
    }
    if let Some(temperature) = config.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = config.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(top_p) = config.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if let Some(seed) = config.seed {
        body["seed"] = serde_json::json!(seed);
    }
    if let Some(presence_penalty) = config.presence_penalty {
        body["presence_penalty"] = serde_json::json!(presence_penalty);
    }
    body
}

/// Map one SSE data payload to chunk frames via `choices[0].delta`.
///
/// Malformed payloads are dropped with a warning; the stream continues.
fn delta_frames(data: &str) -> Vec<Frame> {
    let parsed: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!("dropping malformed SSE chunk: {e}");
            return Vec::new();
        }
    };

    let delta = &parsed["choices"][0]["delta"];
    let mut frames = Vec::new();

    if let Some(tool_call) = delta["tool_calls"][0].as_object() {
        let function = tool_call.get("function");
        let chunk = ToolCallChunk {
            id: tool_call
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            function_name: function
                .and_then(|f| f["name"].as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            arguments_fragment: function
                .and_then(|f| f["arguments"].as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
        };
        frames.push(Frame::new(FramePayload::LlmToolCallChunk(chunk)));
    } else if let Some(content) = delta["content"].as_str()
        && !content.is_empty()
    {
        frames.push(Frame::new(FramePayload::LlmTextChunk(content.to_owned())));
    }

    frames
}

/// Send a frame unless the request was cancelled. Returns false when the
/// stream should stop sending.
async fn send_stream(
    tx: &mpsc::Sender<Frame>,
    frame: Frame,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}

/// Issue one streaming request and feed the resulting frames to `llm-read`.
///
/// On cancellation the SSE body is dropped and nothing further is sent —
/// in particular no synthetic end frame. Transport and HTTP failures are
/// surfaced as `system.error` frames.
async fn run_request(
    client: reqwest::Client,
    config: LlmConfig,
    context: LlmContext,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let body = request_body(&config, &context);
    let request = client
        .post(&config.completions_url)
        .bearer_auth(&config.api_key)
        .json(&body);

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = request.send() => response,
    };
    let response = match response.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(e) => {
            warn!("completion request failed: {e}");
            let frame = Frame::new(FramePayload::SystemError(format!(
                "LLM request failed: {e}"
            )));
            let _ = send_stream(&tx, frame, &cancel).await;
            return;
        }
    };

    if !send_stream(&tx, Frame::new(FramePayload::LlmFullResponseStart), &cancel).await {
        return;
    }

    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();
    'stream: loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.push(&bytes) {
                    if event.is_done() {
                        break 'stream;
                    }
                    for frame in delta_frames(&event.data) {
                        if !send_stream(&tx, frame, &cancel).await {
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                warn!("completion stream failed: {e}");
                let frame = Frame::new(FramePayload::SystemError(format!(
                    "LLM stream failed: {e}"
                )));
                let _ = send_stream(&tx, frame, &cancel).await;
                return;
            }
            None => break,
        }
    }

    let _ = send_stream(&tx, Frame::new(FramePayload::LlmFullResponseEnd), &cancel).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Message;

    fn processor() -> LlmProcessor {
        LlmProcessor::new(LlmConfig::new("gpt-4o", "sk-test")).unwrap()
    }

    fn context() -> LlmContext {
        LlmContext::with_messages(vec![Message::user("Hello")])
    }

    #[test]
    fn rejects_empty_api_key() {
        assert!(LlmProcessor::new(LlmConfig::new("gpt-4o", "")).is_err());
    }

    #[test]
    fn request_body_has_wire_shape() {
        let config = LlmConfig::new("gpt-4o", "sk-test");
        let body = request_body(&config, &context());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        // No tools configured → no tools key at all.
        assert!(body.get("tools").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn request_body_carries_sampling_options() {
        let mut config = LlmConfig::new("gpt-4o", "sk-test");
        config.temperature = Some(0.2);
        config.max_tokens = Some(512);
        config.seed = Some(7);
        let body = request_body(&config, &context());
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["seed"], 7);
    }

    #[test]
    fn delta_text_content_becomes_a_text_chunk() {
        let frames = delta_frames(r#"{"choices":[{"delta":{"content":"Hi"},"index":0}]}"#);
        assert_eq!(frames.len(), 1);
        match &frames[0].payload {
            FramePayload::LlmTextChunk(s) => assert_eq!(s, "Hi"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn delta_tool_call_becomes_a_tool_chunk() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_X","function":{"name":"get_weather","arguments":""}}]},"index":0}]}"#;
        let frames = delta_frames(data);
        assert_eq!(frames.len(), 1);
        match &frames[0].payload {
            FramePayload::LlmToolCallChunk(chunk) => {
                assert_eq!(chunk.id.as_deref(), Some("call_X"));
                assert_eq!(chunk.function_name.as_deref(), Some("get_weather"));
                assert!(chunk.arguments_fragment.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn delta_argument_fragment_only() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"town\":"}}]},"index":0}]}"#;
        let frames = delta_frames(data);
        match &frames[0].payload {
            FramePayload::LlmToolCallChunk(chunk) => {
                assert!(chunk.id.is_none());
                assert_eq!(chunk.arguments_fragment.as_deref(), Some("{\"town\":"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn malformed_delta_is_dropped() {
        assert!(delta_frames("{not json").is_empty());
        assert!(delta_frames(r#"{"choices":[]}"#).is_empty());
    }

    #[tokio::test]
    async fn contexts_queue_while_busy() {
        let mut p = processor();
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        assert!(p.is_busy());
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        assert_eq!(p.pending.len(), 1);
    }

    #[tokio::test]
    async fn interrupt_without_in_flight_request_is_a_no_op() {
        let mut p = processor();
        let out = p
            .transform(port::IN, Frame::new(FramePayload::ControlInterruptStart))
            .unwrap();
        assert!(out.is_empty());
        assert!(!p.discard_stream);
    }

    #[tokio::test]
    async fn interrupt_cancels_and_discards_buffered_deltas() {
        let mut p = processor();
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        // Stream frames of the request arrive, then barge-in.
        let out = p
            .transform(LLM_READ, Frame::new(FramePayload::LlmFullResponseStart))
            .unwrap();
        assert_eq!(out.into_vec().len(), 1);
        p.transform(port::IN, Frame::new(FramePayload::ControlInterruptStart))
            .unwrap();
        assert!(!p.is_busy());

        // Leftover deltas of the cancelled request are dropped, and no
        // synthetic end frame appears.
        let out = p
            .transform(
                LLM_READ,
                Frame::new(FramePayload::LlmTextChunk("stale".into())),
            )
            .unwrap();
        assert!(out.is_empty());
        let out = p
            .transform(LLM_READ, Frame::new(FramePayload::LlmFullResponseEnd))
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn new_request_after_interrupt_resumes_forwarding() {
        let mut p = processor();
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        p.transform(LLM_READ, Frame::new(FramePayload::LlmFullResponseStart))
            .unwrap();
        p.transform(port::IN, Frame::new(FramePayload::ControlInterruptStart))
            .unwrap();

        // A fresh context spawns a new request; its start frame re-enables
        // forwarding even though stale frames were discarded in between.
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        let out = p
            .transform(
                LLM_READ,
                Frame::new(FramePayload::LlmTextChunk("stale".into())),
            )
            .unwrap();
        assert!(out.is_empty());
        let out = p
            .transform(LLM_READ, Frame::new(FramePayload::LlmFullResponseStart))
            .unwrap();
        assert_eq!(out.into_vec().len(), 1);
        let out = p
            .transform(
                LLM_READ,
                Frame::new(FramePayload::LlmTextChunk("fresh".into())),
            )
            .unwrap();
        assert_eq!(out.into_vec().len(), 1);
    }

    #[tokio::test]
    async fn response_end_starts_the_next_queued_context() {
        let mut p = processor();
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        p.transform(port::IN, Frame::new(FramePayload::LlmContext(context())))
            .unwrap();
        assert_eq!(p.pending.len(), 1);

        p.transform(LLM_READ, Frame::new(FramePayload::LlmFullResponseStart))
            .unwrap();
        let out = p
            .transform(LLM_READ, Frame::new(FramePayload::LlmFullResponseEnd))
            .unwrap();
        assert_eq!(out.into_vec().len(), 1);
        // The queued context became the new in-flight request.
        assert!(p.is_busy());
        assert!(p.pending.is_empty());
    }
}
