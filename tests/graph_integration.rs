//! Graph-level properties: per-edge ordering, fan-out, lifecycle, and the
//! splitter and mute-filter scenarios running as wired nodes.

use bytes::Bytes;
use simulflow::config::{AudioSplitterConfig, MuteFilterConfig, MuteStrategy};
use simulflow::frame::{Frame, FrameKind, FramePayload, ToolCallRequest, ToolCallResult, Transcription};
use simulflow::graph::GraphBuilder;
use simulflow::processor::port;
use simulflow::processors::{AudioSplitter, MuteFilter};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn relay() -> MuteFilter {
    // A mute filter with a strategy nothing in the test triggers acts as a
    // pure pass-through node.
    MuteFilter::new(MuteFilterConfig::new(vec![MuteStrategy::BotSpeech])).unwrap()
}

#[tokio::test]
async fn frames_on_an_edge_arrive_exactly_once_and_in_order() {
    init_tracing();
    let mut builder = GraphBuilder::new();
    builder.add_node("a", Box::new(relay()));
    builder.add_node("b", Box::new(relay()));
    builder.connect(("a", port::OUT), ("b", port::IN));
    let mut out_rx = builder.external_output("b", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    let input = graph.input("a").unwrap();
    let count = 200;
    for i in 0..count {
        input
            .send(Frame::new(FramePayload::TranscriptionFinal(
                Transcription::new(format!("frame-{i}")),
            )))
            .await
            .unwrap();
    }

    for i in 0..count {
        let frame = out_rx.recv().await.unwrap();
        match frame.payload {
            FramePayload::TranscriptionFinal(t) => {
                assert_eq!(t.text, format!("frame-{i}"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    // Exactly once: nothing further arrives.
    let extra = tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await;
    assert!(extra.is_err());
    graph.stop().await;
}

#[tokio::test]
async fn splitter_chunks_audio_through_the_graph() {
    let mut builder = GraphBuilder::new();
    builder.add_node(
        "splitter",
        Box::new(AudioSplitter::new(AudioSplitterConfig::with_chunk_size(160)).unwrap()),
    );
    let mut out_rx = builder.external_output("splitter", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    let data: Vec<u8> = (0..401u16).map(|i| (i % 251) as u8).collect();
    graph
        .input("splitter")
        .unwrap()
        .send(Frame::new(FramePayload::AudioOutputRaw(Bytes::from(
            data.clone(),
        ))))
        .await
        .unwrap();

    let mut sizes = Vec::new();
    let mut rejoined = Vec::new();
    for _ in 0..3 {
        let frame = out_rx.recv().await.unwrap();
        match frame.payload {
            FramePayload::AudioOutputRaw(bytes) => {
                sizes.push(bytes.len());
                rejoined.extend_from_slice(&bytes);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    assert_eq!(sizes, vec![160, 160, 81]);
    assert_eq!(rejoined, data);
    graph.stop().await;
}

#[tokio::test]
async fn mute_filter_emits_mute_frames_on_sys_out() {
    let mut builder = GraphBuilder::new();
    builder.add_node(
        "mute",
        Box::new(MuteFilter::new(MuteFilterConfig::new(vec![MuteStrategy::ToolCall])).unwrap()),
    );
    let mut sys_rx = builder.external_output("mute", port::SYS_OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();
    let input = graph.input("mute").unwrap();

    let request = || {
        Frame::new(FramePayload::LlmToolCallRequest(ToolCallRequest {
            call_id: "call_1".into(),
            function_name: "get_weather".into(),
            arguments: "{}".into(),
        }))
    };
    input.send(request()).await.unwrap();
    assert_eq!(sys_rx.recv().await.unwrap().kind(), FrameKind::MuteInputStart);

    // A second request while muted emits nothing additional.
    input.send(request()).await.unwrap();
    input
        .send(Frame::new(FramePayload::LlmToolCallResult(ToolCallResult {
            request: ToolCallRequest {
                call_id: "call_1".into(),
                function_name: "get_weather".into(),
                arguments: "{}".into(),
            },
            result: serde_json::json!("sunny"),
            run_llm: true,
        })))
        .await
        .unwrap();
    assert_eq!(sys_rx.recv().await.unwrap().kind(), FrameKind::MuteInputStop);
    graph.stop().await;
}

#[tokio::test]
async fn sys_out_fans_into_a_peer_sys_in() {
    // mute → relay over a system edge: the mute frame must arrive on the
    // peer's system channel and pass through it.
    let mut builder = GraphBuilder::new();
    builder.add_node(
        "mute",
        Box::new(MuteFilter::new(MuteFilterConfig::new(vec![MuteStrategy::BotSpeech])).unwrap()),
    );
    builder.add_node("sink", Box::new(relay()));
    builder.connect(("mute", port::SYS_OUT), ("sink", port::SYS_IN));
    let mut out_rx = builder.external_output("sink", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    graph
        .input("mute")
        .unwrap()
        .send(Frame::new(FramePayload::BotSpeechStart))
        .await
        .unwrap();

    let frame = out_rx.recv().await.unwrap();
    assert_eq!(frame.kind(), FrameKind::MuteInputStart);
    graph.stop().await;
}

#[tokio::test]
async fn pause_holds_data_and_resume_releases_it() {
    let mut builder = GraphBuilder::new();
    builder.add_node("relay", Box::new(relay()));
    let mut out_rx = builder.external_output("relay", port::OUT);
    let graph = builder.build().unwrap();
    graph.start().await.unwrap();

    graph.pause();
    graph
        .input("relay")
        .unwrap()
        .send(Frame::new(FramePayload::UserSpeechStart))
        .await
        .unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await;
    assert!(nothing.is_err());

    graph.resume();
    let frame = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
        .await
        .expect("resumed")
        .expect("open");
    assert_eq!(frame.kind(), FrameKind::UserSpeechStart);
    graph.stop().await;
}

#[tokio::test]
async fn stop_terminates_workers() {
    let mut builder = GraphBuilder::new();
    builder.add_node("relay", Box::new(relay()));
    let graph = builder.build().unwrap();
    let mut reports = graph.reports();
    graph.start().await.unwrap();
    graph.stop().await;

    let report = reports.recv().await.unwrap();
    assert_eq!(report.node, "relay");
    assert_eq!(report.message, "worker exited");
}
