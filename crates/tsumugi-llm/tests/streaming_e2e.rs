use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use serde_json::json;

use tsumugi_core::config::{StreamConfig, TraceMetadata};
use tsumugi_core::error::{StreamError, TsumugiError};
use tsumugi_core::model::ChatResult;
use tsumugi_llm::anthropic::{Diagnostic, Segment, StreamDriver};
use tsumugi_llm::sink::{ChannelSink, TracedSink, sink_fn};

type Chunk = Result<Vec<u8>, std::io::Error>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tsumugi_llm=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| {
            let event_type = e["type"].as_str().unwrap_or("unknown");
            format!("event: {event_type}\ndata: {e}\n\n")
        })
        .collect()
}

/// Deliver `text` in fixed-size chunks to exercise line reassembly.
fn chunked(text: String, size: usize) -> impl Stream<Item = Chunk> + Send + 'static {
    let chunks: Vec<Chunk> = text
        .into_bytes()
        .chunks(size)
        .map(|c| Ok(c.to_vec()))
        .collect();
    futures::stream::iter(chunks)
}

fn message_start(input_tokens: u64) -> serde_json::Value {
    json!({
        "type": "message_start",
        "message": {
            "id": "msg_01XFDUDYJgAACzvnptvVoYEL",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5-20250929",
            "content": [],
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": input_tokens, "output_tokens": 1}
        }
    })
}

fn message_end(stop_reason: &str, output_tokens: u64) -> [serde_json::Value; 2] {
    [
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"output_tokens": output_tokens}
        }),
        json!({"type": "message_stop"}),
    ]
}

fn text_scenario() -> String {
    let mut events = vec![
        message_start(10),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "ping"}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": " there"}}),
        json!({"type": "content_block_stop", "index": 0}),
    ];
    events.extend(message_end("end_turn", 3));
    sse(&events)
}

#[tokio::test]
async fn text_stream_end_to_end() {
    init_tracing();
    let (sink, mut rx) = ChannelSink::new();
    let config = StreamConfig::new()
        .with_tag("e2e")
        .with_trace(TraceMetadata::new("anthropic", "claude-sonnet-4-5-20250929"));

    let message = StreamDriver::new(config)
        .with_sink(sink)
        .run(chunked(text_scenario(), 7))
        .await
        .unwrap();

    assert_eq!(message.content.len(), 1);
    assert_eq!(message.content[0].as_text(), Some("Hi there"));
    assert_eq!(message.usage.input_tokens, 10);
    assert_eq!(message.usage.output_tokens, 3);
    assert_eq!(message.role, "assistant");
    assert_eq!(message.kind, "message");

    let mut fragments = Vec::new();
    while let Some(fragment) = rx.recv().await {
        fragments.push(fragment);
    }
    assert_eq!(fragments, vec!["Hi", " there"]);
}

#[tokio::test]
async fn tool_use_stream_end_to_end() {
    init_tracing();
    let mut events = vec![
        message_start(25),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me check."}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "call_1", "name": "getWeather", "input": {}}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"loc"}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "ation\":\"NYC\"}"}}),
        json!({"type": "content_block_stop", "index": 1}),
    ];
    events.extend(message_end("tool_use", 40));

    let fragments = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = Arc::clone(&fragments);
    let message = StreamDriver::new(StreamConfig::default())
        .with_sink(sink_fn(move |fragment: &str| {
            seen.lock().unwrap().push(fragment.to_string());
            Ok(())
        }))
        .run(chunked(sse(&events), 16))
        .await
        .unwrap();

    match &message.content[1] {
        Segment::ToolUse(tool) => {
            assert_eq!(tool.id, "call_1");
            assert_eq!(tool.name, "getWeather");
            assert_eq!(
                serde_json::Value::Object(tool.arguments.clone().unwrap()),
                json!({"location": "NYC"})
            );
        }
        other => panic!("expected tool use segment, got {other:?}"),
    }
    assert_eq!(*fragments.lock().unwrap(), vec!["Let me check."]);

    let result: ChatResult = message.into();
    assert_eq!(result.message.content, "Let me check.");
    assert_eq!(result.message.tool_calls.len(), 1);
    assert_eq!(result.stop_reason.as_deref(), Some("tool_use"));
    assert_eq!(result.usage.unwrap().total_tokens, 65);
}

#[tokio::test]
async fn truncated_stream_is_an_error() {
    let events = vec![
        message_start(5),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "partial"}}),
    ];
    let err = StreamDriver::new(StreamConfig::default())
        .run(chunked(sse(&events), 32))
        .await
        .unwrap_err();
    assert!(matches!(err, TsumugiError::Stream(StreamError::TruncatedStream)));
}

#[tokio::test]
async fn events_after_message_stop_are_ignored() {
    let mut body = text_scenario();
    body.push_str("data: {this is not json}\n\n");
    body.push_str("data: {\"type\":\"error\",\"error\":{\"type\":\"api_error\",\"message\":\"late\"}}\n\n");
    let message = StreamDriver::new(StreamConfig::default())
        .run(chunked(body, 64))
        .await
        .unwrap();
    assert_eq!(message.text(), "Hi there");
}

#[tokio::test]
async fn provider_error_event_fails_the_stream() {
    let events = vec![
        message_start(5),
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
    ];
    let err = StreamDriver::new(StreamConfig::default())
        .run(chunked(sse(&events), 64))
        .await
        .unwrap_err();
    match err {
        TsumugiError::Stream(StreamError::ProtocolErrorEvent {
            error_type,
            payload,
            ..
        }) => {
            assert_eq!(error_type, "overloaded_error");
            assert_eq!(payload["error"]["message"], "Overloaded");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn invalid_json_aborts_without_partial_result() {
    let mut body = sse(&[message_start(5)]);
    body.push_str("data: {\"type\": \"content_block_start\",\n\n");
    let err = StreamDriver::new(StreamConfig::default())
        .run(chunked(body, 64))
        .await
        .unwrap_err();
    assert!(matches!(err, TsumugiError::Stream(StreamError::Decode(_))));
}

#[tokio::test]
async fn invalid_tool_arguments_fail_at_stop() {
    let mut events = vec![
        message_start(5),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "c", "name": "f"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"a\": tru"}}),
        json!({"type": "content_block_stop", "index": 0}),
    ];
    events.extend(message_end("tool_use", 1));
    let err = StreamDriver::new(StreamConfig::default())
        .run(chunked(sse(&events), 64))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TsumugiError::Stream(StreamError::ToolArgumentParse { index: 0, .. })
    ));
}

#[tokio::test]
async fn dropped_fragment_receiver_stops_the_stream() {
    let (sink, rx) = ChannelSink::new();
    drop(rx);
    let err = StreamDriver::new(StreamConfig::default())
        .with_sink(TracedSink::new(sink))
        .run(chunked(text_scenario(), 64))
        .await
        .unwrap_err();
    match err {
        TsumugiError::Stream(StreamError::Sink(inner)) => {
            assert_eq!(inner.to_string(), "fragment receiver dropped")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unknown_events_reach_diagnostics_hook() {
    let mut events = vec![
        message_start(5),
        json!({"type": "message_annotation", "note": "new in a later API version"}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "server_tool_use", "id": "s", "name": "web_search"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "done"}}),
        json!({"type": "content_block_stop", "index": 1}),
    ];
    events.extend(message_end("end_turn", 2));

    let seen: Arc<Mutex<Vec<Diagnostic>>> = Arc::default();
    let hook_seen = Arc::clone(&seen);
    let message = StreamDriver::new(StreamConfig::default())
        .with_diagnostics(Arc::new(move |d: &Diagnostic| {
            hook_seen.lock().unwrap().push(d.clone());
        }))
        .run(chunked(sse(&events), 64))
        .await
        .unwrap();

    assert_eq!(message.text(), "done");
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Diagnostic::UnknownEvent {
                event_type: "message_annotation".into()
            },
            Diagnostic::UnsupportedBlock {
                index: 0,
                block_type: "server_tool_use".into()
            },
        ]
    );
}

#[tokio::test]
async fn oversized_line_is_rejected() {
    let huge = "x".repeat(512);
    let mut events = vec![
        message_start(5),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": huge}}),
        json!({"type": "content_block_stop", "index": 0}),
    ];
    events.extend(message_end("end_turn", 2));
    let err = StreamDriver::new(StreamConfig::new().with_max_line_bytes(400))
        .run(chunked(sse(&events), 64))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TsumugiError::Stream(StreamError::LineTooLong { limit: 400 })
    ));
}

#[tokio::test]
async fn cancelling_a_stalled_stream() {
    let stalled = futures::stream::iter(vec![Ok::<_, std::io::Error>(
        sse(&[message_start(5)]).into_bytes(),
    )])
    .chain(futures::stream::pending());
    let pending = StreamDriver::new(StreamConfig::default()).spawn(stalled);
    let token = pending.cancellation_token();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        token.cancel();
    });
    let err = pending.finish().await.unwrap_err();
    assert!(matches!(err, TsumugiError::Stream(StreamError::Cancelled)));
}
