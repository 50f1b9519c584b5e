use antigravity_gateway::egress::{AnthropicStream, OpenAiStream};
use antigravity_gateway::specs::google::GenerateContentResponse;
use antigravity_gateway::upstream::{collect_stream, ChunkStream};
use futures_util::stream;
use serde_json::json;

fn frame(value: serde_json::Value) -> GenerateContentResponse {
    serde_json::from_value(value).expect("valid frame")
}

fn text_frame(text: &str) -> GenerateContentResponse {
    frame(json!({
        "candidates": [ { "content": { "role": "model", "parts": [ { "text": text } ] } } ]
    }))
}

#[test]
fn openai_stream_round_trip_emits_deltas_in_order() {
    let mut stream = OpenAiStream::new("claude-sonnet-4-5");

    let first = stream.on_chunk(&text_frame("po"));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].object, "chat.completion.chunk");
    assert_eq!(first[0].choices[0].delta.role.as_deref(), Some("assistant"));
    assert_eq!(first[0].choices[0].delta.content.as_deref(), Some("po"));

    let second = stream.on_chunk(&text_frame("ng"));
    assert_eq!(second[0].choices[0].delta.content.as_deref(), Some("ng"));
    assert!(second[0].choices[0].delta.role.is_none());

    let last = stream.finish();
    assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
}

#[test]
fn openai_stream_surfaces_reasoning_and_tool_calls() {
    let mut stream = OpenAiStream::new("gemini-3-pro-preview");

    let chunks = stream.on_chunk(&frame(json!({
        "candidates": [ { "content": { "role": "model", "parts": [
            { "text": "let me check", "thought": true },
            { "functionCall": { "id": "c1", "name": "get_time", "args": { "tz": "UTC" } } }
        ] } } ]
    })));

    assert_eq!(chunks.len(), 2);
    assert_eq!(
        chunks[0].choices[0].delta.reasoning_content.as_deref(),
        Some("let me check")
    );
    let call = &chunks[1].choices[0].delta.tool_calls[0];
    assert_eq!(call.id.as_deref(), Some("c1"));
    assert_eq!(
        call.function.as_ref().unwrap().name.as_deref(),
        Some("get_time")
    );

    let last = stream.finish();
    assert_eq!(last.choices[0].finish_reason.as_deref(), Some("tool_calls"));
}

#[test]
fn anthropic_stream_produces_well_formed_event_sequence() {
    let mut stream = AnthropicStream::new("claude-sonnet-4-5-thinking");
    let mut names: Vec<&'static str> = Vec::new();

    for (name, _) in stream.on_chunk(&frame(json!({
        "candidates": [ { "content": { "role": "model", "parts": [
            { "text": "pondering", "thought": true, "thoughtSignature": "sig-a" }
        ] } } ]
    }))) {
        names.push(name);
    }
    for (name, _) in stream.on_chunk(&frame(json!({
        "candidates": [ { "content": { "role": "model", "parts": [
            { "functionCall": { "id": "t1", "name": "grep", "args": { "pattern": "todo" } } }
        ] } } ],
        "usageMetadata": { "promptTokenCount": 9, "candidatesTokenCount": 4, "totalTokenCount": 13 }
    }))) {
        names.push(name);
    }
    for (name, _) in stream.finish() {
        names.push(name);
    }

    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",   // thinking
            "content_block_delta",   // thinking_delta
            "content_block_delta",   // signature_delta
            "content_block_stop",    // thinking closed by tool_use
            "content_block_start",   // tool_use
            "content_block_delta",   // input_json_delta
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}

#[test]
fn anthropic_stream_reports_tool_use_stop_reason_and_usage() {
    let mut stream = AnthropicStream::new("claude-sonnet-4-5");
    let _ = stream.on_chunk(&frame(json!({
        "candidates": [ {
            "content": { "role": "model", "parts": [
                { "functionCall": { "id": "t1", "name": "grep", "args": {} } }
            ] },
            "finishReason": "STOP"
        } ],
        "usageMetadata": { "promptTokenCount": 2, "candidatesTokenCount": 11, "totalTokenCount": 13 }
    })));

    let finish = stream.finish();
    let message_delta = finish
        .iter()
        .find(|(name, _)| *name == "message_delta")
        .map(|(_, data)| data.clone())
        .expect("message_delta event");
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
    assert_eq!(message_delta["usage"]["output_tokens"], 11);
}

#[tokio::test]
async fn merged_stream_behaves_like_a_single_response() {
    let mut tail = text_frame("ng");
    tail.usage_metadata = serde_json::from_value(json!({
        "promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5
    }))
    .ok();
    let chunks: Vec<antigravity_gateway::types::Result<GenerateContentResponse>> =
        vec![Ok(text_frame("po")), Ok(tail)];
    let stream: ChunkStream = Box::pin(stream::iter(chunks));

    let merged = collect_stream(stream).await.expect("merged");
    let completion = antigravity_gateway::egress::to_openai_completion(&merged, "gemini-3-flash");
    assert_eq!(
        completion.choices[0].message.content.as_deref(),
        Some("pong")
    );
    assert_eq!(completion.usage.as_ref().unwrap().total_tokens, 5);
}
