//! Assistant assembler scenarios, including the full tool-call loop
//! through the context aggregator's background tool worker.

use async_trait::async_trait;
use simulflow::config::{AssistantAssemblerConfig, ContextAggregatorConfig};
use simulflow::context::{LlmContext, Message, Role, ToolDefinition, ToolHandler};
use simulflow::error::Result;
use simulflow::frame::{Frame, FramePayload, ToolCallChunk};
use simulflow::graph::GraphBuilder;
use simulflow::processor::port;
use simulflow::processors::{AssistantAssembler, ContextAggregator};
use std::sync::Arc;
use std::time::Duration;

struct WeatherTool;

#[async_trait]
impl ToolHandler for WeatherTool {
    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "forecast": "sunny", "town": args["town"] }))
    }
}

fn weather_context() -> LlmContext {
    LlmContext {
        messages: vec![Message::system("You can check the weather.")],
        tools: vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather for a town".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "town": { "type": "string" } },
                "required": ["town"],
            }),
            strict: None,
            handler: Arc::new(WeatherTool),
        }],
    }
}

fn tool_chunk(
    id: Option<&str>,
    name: Option<&str>,
    fragment: Option<&str>,
) -> FramePayload {
    FramePayload::LlmToolCallChunk(ToolCallChunk {
        id: id.map(str::to_owned),
        function_name: name.map(str::to_owned),
        arguments_fragment: fragment.map(str::to_owned),
    })
}

#[tokio::test]
async fn streaming_tool_call_reassembles_into_one_append() {
    let mut builder = GraphBuilder::new();
    builder.add_node(
        "asm",
        Box::new(AssistantAssembler::new(AssistantAssemblerConfig::default())),
    );
    let mut out_rx = builder.external_output("asm", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    let input = graph.input("asm").unwrap();
    let payloads = vec![
        FramePayload::LlmFullResponseStart,
        tool_chunk(Some("call_X"), Some("get_weather"), None),
        tool_chunk(None, None, Some("{\"")),
        tool_chunk(None, None, Some("town")),
        tool_chunk(None, None, Some("\":\"")),
        tool_chunk(None, None, Some("NYC")),
        tool_chunk(None, None, Some("\"}")),
        FramePayload::LlmFullResponseEnd,
    ];
    for payload in payloads {
        input.send(Frame::new(payload)).await.unwrap();
    }

    let frame = out_rx.recv().await.unwrap();
    let FramePayload::LlmContextMessagesAppend(append) = frame.payload else {
        panic!("expected llm.context.messages.append");
    };
    assert!(append.tool_call);
    assert!(!append.run_llm);
    assert_eq!(append.messages.len(), 1);
    let calls = &append.messages[0].tool_calls;
    assert_eq!(calls[0].id, "call_X");
    assert_eq!(calls[0].function.name, "get_weather");
    assert_eq!(calls[0].function.arguments, r#"{"town":"NYC"}"#);

    // Exactly one append for the whole stream.
    let extra = tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await;
    assert!(extra.is_err());
    graph.stop().await;
}

#[tokio::test]
async fn tool_call_loop_executes_and_reprompts_the_llm() {
    // assembler → aggregator: the aggregator routes the tool-call append to
    // its background worker, appends the result, and emits the updated
    // context so the LLM can continue.
    let mut builder = GraphBuilder::new();
    builder.add_node(
        "asm",
        Box::new(AssistantAssembler::new(AssistantAssemblerConfig::default())),
    );
    builder.add_node(
        "agg",
        Box::new(ContextAggregator::new(ContextAggregatorConfig {
            context: weather_context(),
            debug: false,
        })),
    );
    builder.connect(("asm", port::OUT), ("agg", port::IN));
    let mut context_rx = builder.external_output("agg", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    let input = graph.input("asm").unwrap();
    let payloads = vec![
        FramePayload::LlmFullResponseStart,
        tool_chunk(Some("call_1"), Some("get_weather"), Some(r#"{"town":"NYC"}"#)),
        FramePayload::LlmFullResponseEnd,
    ];
    for payload in payloads {
        input.send(Frame::new(payload)).await.unwrap();
    }

    let frame = tokio::time::timeout(Duration::from_secs(2), context_rx.recv())
        .await
        .expect("context should arrive")
        .expect("channel open");
    let FramePayload::LlmContext(context) = frame.payload else {
        panic!("expected llm.context");
    };

    // system + assistant tool_calls + tool result.
    assert_eq!(context.messages.len(), 3);
    assert!(context.contains_tool_call("call_1"));
    let result = &context.messages[2];
    assert_eq!(result.role, Role::Tool);
    assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
    let body = result.content.as_text().expect("tool result is text");
    assert!(body.contains("sunny"));
    graph.stop().await;
}

#[tokio::test]
async fn plain_text_response_appends_without_rerunning() {
    let mut builder = GraphBuilder::new();
    builder.add_node(
        "asm",
        Box::new(AssistantAssembler::new(AssistantAssemblerConfig::default())),
    );
    builder.add_node(
        "agg",
        Box::new(ContextAggregator::new(ContextAggregatorConfig::default())),
    );
    builder.connect(("asm", port::OUT), ("agg", port::IN));
    let mut context_rx = builder.external_output("agg", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    let input = graph.input("asm").unwrap();
    for payload in [
        FramePayload::LlmFullResponseStart,
        FramePayload::LlmTextChunk("The weather is ".into()),
        FramePayload::LlmTextChunk("lovely.".into()),
        FramePayload::LlmFullResponseEnd,
    ] {
        input.send(Frame::new(payload)).await.unwrap();
    }

    // run_llm is false for plain text, so no context comes out.
    let nothing = tokio::time::timeout(Duration::from_millis(200), context_rx.recv()).await;
    assert!(nothing.is_err());
    graph.stop().await;
}
