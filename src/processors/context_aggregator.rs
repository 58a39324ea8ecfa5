//! User-side dialog state machine.
//!
//! Turns speech start/stop markers and transcriptions into a single
//! appended user message on the LLM context, then emits the updated
//! context to drive the LLM. Also the merge point for everything else
//! that belongs in conversation history: assistant appends coming back
//! from the assembler, tool results, scenario context swaps, and bot
//! utterances the user never asked for.
//!
//! Tool calls routed to the `tool-write` port are executed by a background
//! worker; results come back through the private `tool-read` port as
//! `llm.tool.call.result` frames, so `transform` itself never blocks on a
//! handler.

use crate::config::ContextAggregatorConfig;
use crate::context::{LlmContext, Message, ToolCall, ToolDefinition};
use crate::error::Result;
use crate::frame::{Frame, FramePayload, ToolCallRequest, ToolCallResult};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorIo, ProcessorSpec, port};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Private out-port: appends carrying tool calls, consumed by the worker.
pub const TOOL_WRITE: &str = "tool-write";
/// Private in-port: tool results produced by the worker.
pub const TOOL_READ: &str = "tool-read";

/// Capacity of the private tool channels.
const TOOL_CHANNEL_CAPACITY: usize = 32;

/// Aggregates user turns and owns the conversation context.
pub struct ContextAggregator {
    context: LlmContext,
    debug: bool,

    aggregating: bool,
    aggregation: String,
    seen_start_frame: bool,
    seen_end_frame: bool,
    seen_interim_results: bool,

    /// Mirror of `context.tools` shared with the tool worker.
    tools: Arc<RwLock<Vec<ToolDefinition>>>,
    tool_write_tx: Option<mpsc::Sender<Frame>>,
    tool_write_rx: Option<mpsc::Receiver<Frame>>,
    tool_read_tx: mpsc::Sender<Frame>,
    tool_read_rx: Option<mpsc::Receiver<Frame>>,
    cancel: CancellationToken,
}

impl ContextAggregator {
    pub fn new(config: ContextAggregatorConfig) -> Self {
        let (tool_write_tx, tool_write_rx) = mpsc::channel(TOOL_CHANNEL_CAPACITY);
        let (tool_read_tx, tool_read_rx) = mpsc::channel(TOOL_CHANNEL_CAPACITY);
        let tools = Arc::new(RwLock::new(config.context.tools.clone()));
        Self {
            context: config.context,
            debug: config.debug,
            aggregating: false,
            aggregation: String::new(),
            seen_start_frame: false,
            seen_end_frame: false,
            seen_interim_results: false,
            tools,
            tool_write_tx: Some(tool_write_tx),
            tool_write_rx: Some(tool_write_rx),
            tool_read_tx,
            tool_read_rx: Some(tool_read_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// The current conversation context.
    pub fn context(&self) -> &LlmContext {
        &self.context
    }

    fn context_frame(&self) -> Frame {
        Frame::new(FramePayload::LlmContext(self.context.clone()))
    }

    fn sync_tools(&self) {
        if let Ok(mut tools) = self.tools.write() {
            *tools = self.context.tools.clone();
        }
    }

    fn on_speech_start(&mut self) {
        // Repeat start while aggregating is idempotent.
        if self.aggregating && self.seen_start_frame && !self.seen_end_frame {
            return;
        }
        if self.debug {
            debug!("user speech started, opening aggregation");
        }
        self.aggregating = true;
        self.seen_start_frame = true;
        self.seen_end_frame = false;
        self.seen_interim_results = false;
        self.aggregation.clear();
    }

    fn on_speech_stop(&mut self, outputs: &mut Outputs) {
        if !self.aggregating {
            return;
        }
        if !self.aggregation.is_empty() && !self.seen_interim_results {
            self.finalize(outputs);
        } else {
            // A final transcription may still be on its way.
            self.seen_end_frame = true;
        }
    }

    fn on_final_transcription(&mut self, text: &str, outputs: &mut Outputs) {
        if !self.aggregating || !self.seen_start_frame {
            debug!("dropping out-of-order transcription");
            return;
        }
        if !text.is_empty() {
            if !self.aggregation.is_empty() {
                self.aggregation.push(' ');
            }
            self.aggregation.push_str(text);
        }
        if self.seen_end_frame {
            self.finalize(outputs);
        }
    }

    fn on_interim_transcription(&mut self) {
        if self.aggregating {
            self.seen_interim_results = true;
        }
    }

    /// Append the aggregated user turn and emit the updated context.
    /// Empty aggregations never produce a message.
    fn finalize(&mut self, outputs: &mut Outputs) {
        if !self.aggregation.is_empty() {
            let text = std::mem::take(&mut self.aggregation);
            if self.debug {
                debug!(text = %text, "finalizing user turn");
            }
            self.context.append_message(Message::user(text));
            outputs.emit(port::OUT, self.context_frame());
        }
        self.aggregating = false;
        self.seen_start_frame = false;
        self.seen_end_frame = false;
        self.seen_interim_results = false;
        self.aggregation.clear();
    }

    fn on_tool_result(&mut self, result: ToolCallResult, outputs: &mut Outputs) {
        let request = &result.request;
        if !self.context.contains_tool_call(&request.call_id) {
            self.context
                .append_message(Message::assistant_tool_calls(vec![ToolCall::function(
                    request.call_id.clone(),
                    request.function_name.clone(),
                    request.arguments.clone(),
                )]));
        }
        let content = match &result.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.context
            .append_message(Message::tool_result(request.call_id.clone(), content));
        if result.run_llm {
            outputs.emit(port::OUT, self.context_frame());
        }
    }
}

impl Processor for ContextAggregator {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "context-aggregator",
            ins: &[port::IN, port::SYS_IN, TOOL_READ],
            outs: &[port::OUT, TOOL_WRITE],
        }
    }

    fn take_io(&mut self) -> ProcessorIo {
        let mut io = ProcessorIo::default();
        if let Some(rx) = self.tool_read_rx.take() {
            io.background_in.push((TOOL_READ, rx));
        }
        if let Some(tx) = self.tool_write_tx.take() {
            io.internal_out.push((TOOL_WRITE, tx));
        }
        io
    }

    fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Start => {
                if let Some(write_rx) = self.tool_write_rx.take() {
                    tokio::spawn(tool_worker(
                        write_rx,
                        self.tool_read_tx.clone(),
                        Arc::clone(&self.tools),
                        self.cancel.child_token(),
                    ));
                }
            }
            LifecycleEvent::Stop => self.cancel.cancel(),
            _ => {}
        }
        Ok(())
    }

    fn transform(&mut self, _port: &str, frame: Frame) -> Result<Outputs> {
        let kind = frame.kind();
        let mut outputs = Outputs::none();
        match frame.payload {
            FramePayload::UserSpeechStart => self.on_speech_start(),
            FramePayload::UserSpeechStop => self.on_speech_stop(&mut outputs),
            FramePayload::TranscriptionFinal(t) => {
                self.on_final_transcription(&t.text, &mut outputs);
            }
            FramePayload::TranscriptionInterim(_) => self.on_interim_transcription(),

            FramePayload::LlmToolCallResult(result) => self.on_tool_result(result, &mut outputs),

            FramePayload::LlmContextMessagesAppend(append) => {
                self.context.append_messages(append.messages.clone());
                if append.run_llm {
                    outputs.emit(port::OUT, self.context_frame());
                }
                if append.tool_call {
                    outputs.emit(
                        TOOL_WRITE,
                        Frame::new(FramePayload::LlmContextMessagesAppend(append)),
                    );
                }
            }

            FramePayload::SystemConfigChange(delta) => {
                if let Some(context) = delta.llm_context {
                    debug!("replacing conversation context from config change");
                    self.context = context;
                    self.sync_tools();
                }
            }

            FramePayload::ScenarioContextUpdate(update) => {
                self.context = LlmContext {
                    messages: update.messages,
                    tools: update.tools,
                };
                self.sync_tools();
                if update.run_llm {
                    outputs.emit(port::OUT, self.context_frame());
                }
            }

            FramePayload::Speak(speak) => {
                // Scripted bot utterances still belong in history.
                self.context.append_message(Message::assistant(speak.text));
            }

            _ => {
                debug!(kind = %kind, "context aggregator ignoring frame");
            }
        }
        Ok(outputs)
    }
}

/// Executes tool calls off the transform path.
///
/// Consumes appends routed to `tool-write`, runs each call's handler, and
/// feeds one `llm.tool.call.result` per call back through `tool-read` with
/// `run_llm` set so the conversation continues.
async fn tool_worker(
    mut write_rx: mpsc::Receiver<Frame>,
    read_tx: mpsc::Sender<Frame>,
    tools: Arc<RwLock<Vec<ToolDefinition>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = write_rx.recv() => {
                let Some(frame) = maybe else { break };
                let FramePayload::LlmContextMessagesAppend(append) = frame.payload else {
                    continue;
                };
                for message in &append.messages {
                    for call in &message.tool_calls {
                        let result = invoke_tool(&tools, call).await;
                        let frame = Frame::new(FramePayload::LlmToolCallResult(ToolCallResult {
                            request: ToolCallRequest {
                                call_id: call.id.clone(),
                                function_name: call.function.name.clone(),
                                arguments: call.function.arguments.clone(),
                            },
                            result,
                            run_llm: true,
                        }));
                        if read_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
    debug!("tool worker exited");
}

/// Run one tool call. The arguments string is parsed here, at the point of
/// invocation. Failures become an error object so the dialog can continue.
async fn invoke_tool(
    tools: &Arc<RwLock<Vec<ToolDefinition>>>,
    call: &ToolCall,
) -> serde_json::Value {
    let handler = match tools.read() {
        Ok(tools) => tools
            .iter()
            .find(|t| t.name == call.function.name)
            .map(|t| Arc::clone(&t.handler)),
        Err(_) => None,
    };
    let Some(handler) = handler else {
        warn!(tool = %call.function.name, "unknown tool requested");
        return serde_json::json!({
            "error": format!("unknown tool '{}'", call.function.name)
        });
    };

    let raw = call.function.arguments.trim();
    let args: serde_json::Value = if raw.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = %call.function.name, "malformed tool arguments: {e}");
                return serde_json::json!({
                    "error": format!("invalid arguments: {e}")
                });
            }
        }
    };

    match handler.call(args).await {
        Ok(value) => value,
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Role, ToolHandler};
    use crate::frame::{ContextAppend, ContextUpdate, SpeakText, Transcription};
    use async_trait::async_trait;

    fn aggregator_with(messages: Vec<Message>) -> ContextAggregator {
        ContextAggregator::new(ContextAggregatorConfig {
            context: LlmContext::with_messages(messages),
            debug: false,
        })
    }

    fn feed(a: &mut ContextAggregator, payload: FramePayload) -> Vec<(&'static str, Frame)> {
        a.transform(port::IN, Frame::new(payload)).unwrap().into_vec()
    }

    fn contexts(emitted: Vec<(&'static str, Frame)>) -> Vec<LlmContext> {
        emitted
            .into_iter()
            .filter_map(|(_, f)| match f.payload {
                FramePayload::LlmContext(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn system_seed() -> Vec<Message> {
        vec![Message::assistant("You are a helpful assistant")]
    }

    #[test]
    fn canonical_turn_start_transcript_stop() {
        let mut a = aggregator_with(system_seed());
        assert!(feed(&mut a, FramePayload::UserSpeechStart).is_empty());
        assert!(
            feed(
                &mut a,
                FramePayload::TranscriptionFinal(Transcription::new("Hello there")),
            )
            .is_empty()
        );
        let out = contexts(feed(&mut a, FramePayload::UserSpeechStop));
        assert_eq!(out.len(), 1);
        let messages = &out[0].messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content.as_text(), Some("You are a helpful assistant"));
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content.as_text(), Some("Hello there"));
    }

    #[test]
    fn late_final_transcription_after_stop() {
        let mut a = aggregator_with(system_seed());
        feed(&mut a, FramePayload::UserSpeechStart);
        assert!(feed(&mut a, FramePayload::UserSpeechStop).is_empty());
        let out = contexts(feed(
            &mut a,
            FramePayload::TranscriptionFinal(Transcription::new("Hello there")),
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].messages[1].content.as_text(), Some("Hello there"));
    }

    #[test]
    fn interim_results_defer_finalization_until_the_final() {
        let mut a = aggregator_with(system_seed());
        feed(&mut a, FramePayload::UserSpeechStart);
        feed(
            &mut a,
            FramePayload::TranscriptionInterim(Transcription::new("Hello")),
        );
        assert!(feed(&mut a, FramePayload::UserSpeechStop).is_empty());
        feed(
            &mut a,
            FramePayload::TranscriptionInterim(Transcription::new("Hello,")),
        );
        let out = contexts(feed(
            &mut a,
            FramePayload::TranscriptionFinal(Transcription::new("Hello there")),
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].messages[1].content.as_text(), Some("Hello there"));
        assert_eq!(out[0].messages.len(), 2);
    }

    #[test]
    fn empty_aggregation_never_appends() {
        let mut a = aggregator_with(system_seed());
        feed(&mut a, FramePayload::UserSpeechStart);
        assert!(feed(&mut a, FramePayload::UserSpeechStop).is_empty());
        // Interims alone never produce a message either.
        feed(&mut a, FramePayload::UserSpeechStart);
        feed(
            &mut a,
            FramePayload::TranscriptionInterim(Transcription::new("Hel")),
        );
        assert!(feed(&mut a, FramePayload::UserSpeechStop).is_empty());
        assert_eq!(a.context().messages.len(), 1);
    }

    #[test]
    fn out_of_order_transcription_is_dropped() {
        let mut a = aggregator_with(system_seed());
        let out = feed(
            &mut a,
            FramePayload::TranscriptionFinal(Transcription::new("ghost")),
        );
        assert!(out.is_empty());
        assert_eq!(a.context().messages.len(), 1);
    }

    #[test]
    fn repeat_speech_start_is_idempotent() {
        let mut a = aggregator_with(system_seed());
        feed(&mut a, FramePayload::UserSpeechStart);
        feed(
            &mut a,
            FramePayload::TranscriptionFinal(Transcription::new("Hello")),
        );
        // A duplicate start must not clear what we have.
        feed(&mut a, FramePayload::UserSpeechStart);
        feed(
            &mut a,
            FramePayload::TranscriptionFinal(Transcription::new("there")),
        );
        let out = contexts(feed(&mut a, FramePayload::UserSpeechStop));
        assert_eq!(out[0].messages[1].content.as_text(), Some("Hello there"));
    }

    #[test]
    fn stop_before_start_race_resets_cleanly() {
        let mut a = aggregator_with(system_seed());
        feed(&mut a, FramePayload::UserSpeechStart);
        feed(&mut a, FramePayload::UserSpeechStop);
        // New turn after the unanswered stop starts from a clean slate.
        feed(&mut a, FramePayload::UserSpeechStart);
        feed(
            &mut a,
            FramePayload::TranscriptionFinal(Transcription::new("Fresh turn")),
        );
        let out = contexts(feed(&mut a, FramePayload::UserSpeechStop));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].messages[1].content.as_text(), Some("Fresh turn"));
    }

    #[test]
    fn append_routes_by_properties() {
        let mut a = aggregator_with(Vec::new());
        let call = ToolCall::function("call_9", "lookup", "{}");
        let out = feed(
            &mut a,
            FramePayload::LlmContextMessagesAppend(ContextAppend {
                messages: vec![Message::assistant_tool_calls(vec![call])],
                tool_call: true,
                run_llm: true,
            }),
        );
        let ports: Vec<_> = out.iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![port::OUT, TOOL_WRITE]);
        assert!(a.context().contains_tool_call("call_9"));
    }

    #[test]
    fn append_without_routing_only_updates_state() {
        let mut a = aggregator_with(Vec::new());
        let out = feed(
            &mut a,
            FramePayload::LlmContextMessagesAppend(ContextAppend {
                messages: vec![Message::assistant("noted")],
                tool_call: false,
                run_llm: false,
            }),
        );
        assert!(out.is_empty());
        assert_eq!(a.context().messages.len(), 1);
    }

    #[test]
    fn tool_result_appends_request_and_result() {
        let mut a = aggregator_with(Vec::new());
        let out = feed(
            &mut a,
            FramePayload::LlmToolCallResult(ToolCallResult {
                request: ToolCallRequest {
                    call_id: "call_7".into(),
                    function_name: "get_weather".into(),
                    arguments: r#"{"town":"NYC"}"#.into(),
                },
                result: serde_json::json!({"forecast": "sunny"}),
                run_llm: true,
            }),
        );
        let messages = &a.context().messages;
        assert_eq!(messages.len(), 2);
        assert!(a.context().contains_tool_call("call_7"));
        assert_eq!(messages[1].role, Role::Tool);
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(contexts(out).len(), 1);
    }

    #[test]
    fn tool_result_does_not_duplicate_an_existing_request() {
        let mut a = aggregator_with(Vec::new());
        feed(
            &mut a,
            FramePayload::LlmContextMessagesAppend(ContextAppend {
                messages: vec![Message::assistant_tool_calls(vec![ToolCall::function(
                    "call_7",
                    "get_weather",
                    "{}",
                )])],
                tool_call: false,
                run_llm: false,
            }),
        );
        feed(
            &mut a,
            FramePayload::LlmToolCallResult(ToolCallResult {
                request: ToolCallRequest {
                    call_id: "call_7".into(),
                    function_name: "get_weather".into(),
                    arguments: "{}".into(),
                },
                result: serde_json::Value::String("sunny".into()),
                run_llm: false,
            }),
        );
        // One request message + one result message, no duplicate request.
        assert_eq!(a.context().messages.len(), 2);
    }

    #[test]
    fn config_change_replaces_context_wholesale() {
        let mut a = aggregator_with(system_seed());
        let replacement = LlmContext::with_messages(vec![Message::system("replaced")]);
        let delta = crate::frame::ConfigDelta {
            llm_context: Some(replacement),
            ..Default::default()
        };
        feed(&mut a, FramePayload::SystemConfigChange(delta));
        assert_eq!(a.context().messages.len(), 1);
        assert_eq!(a.context().messages[0].content.as_text(), Some("replaced"));
    }

    #[test]
    fn scenario_update_replaces_and_optionally_runs() {
        let mut a = aggregator_with(system_seed());
        let out = feed(
            &mut a,
            FramePayload::ScenarioContextUpdate(ContextUpdate {
                messages: vec![Message::system("scene two")],
                tools: Vec::new(),
                run_llm: true,
            }),
        );
        assert_eq!(contexts(out).len(), 1);
        assert_eq!(a.context().messages[0].content.as_text(), Some("scene two"));
    }

    #[test]
    fn speak_frames_append_as_assistant_history() {
        let mut a = aggregator_with(Vec::new());
        feed(
            &mut a,
            FramePayload::Speak(SpeakText::new("Welcome! How can I help?")),
        );
        assert_eq!(a.context().messages.len(), 1);
        assert_eq!(a.context().messages[0].role, Role::Assistant);
    }

    struct WeatherTool;

    #[async_trait]
    impl ToolHandler for WeatherTool {
        async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "forecast": "sunny", "town": args["town"] }))
        }
    }

    fn weather_tools() -> Arc<RwLock<Vec<ToolDefinition>>> {
        Arc::new(RwLock::new(vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather".into(),
            parameters: serde_json::json!({"type": "object"}),
            strict: None,
            handler: Arc::new(WeatherTool),
        }]))
    }

    #[tokio::test]
    async fn invoke_tool_parses_arguments_at_the_call_site() {
        let tools = weather_tools();
        let call = ToolCall::function("call_1", "get_weather", r#"{"town":"NYC"}"#);
        let result = invoke_tool(&tools, &call).await;
        assert_eq!(result["town"], "NYC");
    }

    #[tokio::test]
    async fn invoke_tool_reports_unknown_tools_as_error_objects() {
        let tools = weather_tools();
        let call = ToolCall::function("call_1", "launch_rocket", "{}");
        let result = invoke_tool(&tools, &call).await;
        assert!(result["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn invoke_tool_reports_malformed_arguments() {
        let tools = weather_tools();
        let call = ToolCall::function("call_1", "get_weather", r#"{"town":"#);
        let result = invoke_tool(&tools, &call).await;
        assert!(result["error"].as_str().unwrap().contains("invalid arguments"));
    }

    #[tokio::test]
    async fn tool_worker_round_trip() {
        let (write_tx, write_rx) = mpsc::channel(4);
        let (read_tx, mut read_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(tool_worker(
            write_rx,
            read_tx,
            weather_tools(),
            cancel.clone(),
        ));

        let append = ContextAppend {
            messages: vec![Message::assistant_tool_calls(vec![ToolCall::function(
                "call_1",
                "get_weather",
                r#"{"town":"NYC"}"#,
            )])],
            tool_call: true,
            run_llm: false,
        };
        write_tx
            .send(Frame::new(FramePayload::LlmContextMessagesAppend(append)))
            .await
            .unwrap();

        let frame = read_rx.recv().await.unwrap();
        match frame.payload {
            FramePayload::LlmToolCallResult(result) => {
                assert_eq!(result.request.call_id, "call_1");
                assert!(result.run_llm);
                assert_eq!(result.result["forecast"], "sunny");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        cancel.cancel();
    }
}
