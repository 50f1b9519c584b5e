//! Egress translation: upstream Google responses back into the caller's
//! dialect, either as one assembled message or as translated stream events.

use crate::signatures::SignatureCache;
use crate::specs::anthropic::{MessagesResponse, ResponseBlock};
use crate::specs::google::{FunctionCall, GenerateContentResponse, Part};
use crate::specs::openai::*;
use crate::types::*;

/// Map the upstream finish reason onto the Anthropic vocabulary.
fn anthropic_stop_reason(finish: Option<&str>, saw_tool_use: bool) -> &'static str {
    match finish {
        Some("MAX_TOKENS") => "max_tokens",
        _ if saw_tool_use => "tool_use",
        _ => "end_turn",
    }
}

fn openai_finish_reason(finish: Option<&str>, saw_tool_use: bool) -> &'static str {
    match finish {
        Some("MAX_TOKENS") => "length",
        _ if saw_tool_use => "tool_calls",
        _ => "stop",
    }
}

fn usage_from_metadata(resp: &GenerateContentResponse) -> Usage {
    match &resp.usage_metadata {
        Some(meta) => Usage {
            input_tokens: meta.prompt_token_count,
            output_tokens: meta.candidates_token_count,
            cache_read_input_tokens: meta.cached_content_token_count,
            thinking_tokens: meta.thoughts_token_count,
        },
        None => Usage::default(),
    }
}

fn is_real_signature(sig: &str) -> bool {
    !sig.is_empty() && sig != crate::constants::SKIP_SIGNATURE_SENTINEL
}

/// Bind every signature in a response to the family that produced it, so
/// later turns can be checked before dispatch.
pub fn remember_response_signatures(
    resp: &GenerateContentResponse,
    session_id: &str,
    family: ModelFamily,
    signatures: &SignatureCache,
) {
    for candidate in &resp.candidates {
        for part in &candidate.content.parts {
            if let Some(sig) = part.thought_signature.as_deref() {
                if is_real_signature(sig) {
                    signatures.remember(session_id, sig, family);
                }
            }
        }
    }
}

/// --- HUB LIFT (reverse of the projection) ---

/// Translate upstream parts into assistant hub parts. Consecutive text
/// parts merge; a signed function call grows a preceding thinking part
/// carrying the same bytes unless one is already open.
pub fn lift_response_parts(parts: &[Part]) -> Vec<MessagePart> {
    let mut out: Vec<MessagePart> = Vec::new();
    for part in parts {
        if part.thought == Some(true) {
            let text = part.text.clone().unwrap_or_default();
            let signature = part.thought_signature.clone().filter(|s| is_real_signature(s));
            match out.last_mut() {
                Some(MessagePart::Thought {
                    content,
                    signature: existing,
                }) if existing.is_none() || *existing == signature => {
                    content.push_str(&text);
                    if existing.is_none() {
                        *existing = signature;
                    }
                }
                _ => out.push(MessagePart::Thought {
                    content: text,
                    signature,
                }),
            }
            continue;
        }
        if let Some(fc) = &part.function_call {
            let signature = part.thought_signature.clone().filter(|s| is_real_signature(s));
            if let Some(sig) = &signature {
                let already_open = matches!(
                    out.last(),
                    Some(MessagePart::Thought { signature: Some(existing), .. }) if existing == sig
                );
                if !already_open {
                    out.push(MessagePart::Thought {
                        content: String::new(),
                        signature: Some(sig.clone()),
                    });
                }
            }
            out.push(MessagePart::ToolCall {
                id: fc
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                name: fc.name.clone(),
                arguments: fc.args.clone(),
                thought_signature: signature,
            });
            continue;
        }
        if let Some(text) = &part.text {
            match out.last_mut() {
                Some(MessagePart::Text { content }) => content.push_str(text),
                _ => out.push(MessagePart::Text {
                    content: text.clone(),
                }),
            }
        }
    }
    out
}

/// --- BATCHED RESPONSES ---

pub fn to_anthropic_response(resp: &GenerateContentResponse, model: &str) -> MessagesResponse {
    let parts = resp
        .candidates
        .first()
        .map(|c| lift_response_parts(&c.content.parts))
        .unwrap_or_default();

    let mut content = Vec::with_capacity(parts.len());
    let mut saw_tool_use = false;
    for part in parts {
        match part {
            MessagePart::Text { content: text } => content.push(ResponseBlock::Text { text }),
            MessagePart::Thought {
                content: thinking,
                signature,
            } => content.push(ResponseBlock::Thinking {
                thinking,
                signature,
            }),
            MessagePart::ToolCall {
                id,
                name,
                arguments,
                ..
            } => {
                saw_tool_use = true;
                content.push(ResponseBlock::ToolUse {
                    id,
                    name,
                    input: arguments,
                });
            }
            _ => {}
        }
    }

    let finish = resp
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref());

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: Some(anthropic_stop_reason(finish, saw_tool_use).to_string()),
        stop_sequence: None,
        usage: usage_from_metadata(resp),
    }
}

pub fn to_openai_completion(resp: &GenerateContentResponse, model: &str) -> ChatCompletion {
    let parts = resp
        .candidates
        .first()
        .map(|c| lift_response_parts(&c.content.parts))
        .unwrap_or_default();

    let mut texts = Vec::new();
    let mut thoughts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        match part {
            MessagePart::Text { content } => texts.push(content),
            MessagePart::Thought { content, .. } => {
                if !content.is_empty() {
                    thoughts.push(content);
                }
            }
            MessagePart::ToolCall {
                id,
                name,
                arguments,
                ..
            } => tool_calls.push(ChatToolCall {
                id,
                r#type: "function".to_string(),
                function: ChatFunctionCall {
                    name,
                    arguments: arguments.to_string(),
                },
            }),
            _ => {}
        }
    }

    let finish = resp
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref());
    let usage = usage_from_metadata(resp);

    ChatCompletion {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage {
                role: "assistant".to_string(),
                content: if texts.is_empty() {
                    None
                } else {
                    Some(texts.join(""))
                },
                reasoning_content: if thoughts.is_empty() {
                    None
                } else {
                    Some(thoughts.join(""))
                },
                tool_calls: tool_calls.clone(),
            },
            finish_reason: Some(openai_finish_reason(finish, !tool_calls.is_empty()).to_string()),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
        }),
    }
}

/// --- STREAMING: ANTHROPIC SSE EVENTS ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Thinking,
    Text,
    ToolUse,
}

/// Stateful Google-chunk to Anthropic-event translator. Each upstream chunk
/// produces a bounded batch of `(event, data)` pairs, forwarded in arrival
/// order.
pub struct AnthropicStream {
    model: String,
    message_id: String,
    started: bool,
    block: OpenBlock,
    block_index: u32,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    usage: Usage,
}

pub type SseEvent = (&'static str, serde_json::Value);

impl AnthropicStream {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            block: OpenBlock::None,
            block_index: 0,
            saw_tool_use: false,
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<SseEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push((
            "message_start",
            serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            }),
        ));
    }

    fn close_block(&mut self, events: &mut Vec<SseEvent>) {
        if self.block == OpenBlock::None {
            return;
        }
        events.push((
            "content_block_stop",
            serde_json::json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block = OpenBlock::None;
        self.block_index += 1;
    }

    fn open_block(&mut self, kind: OpenBlock, start: serde_json::Value, events: &mut Vec<SseEvent>) {
        self.close_block(events);
        events.push((
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": start,
            }),
        ));
        self.block = kind;
    }

    pub fn on_chunk(&mut self, chunk: &GenerateContentResponse) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if chunk.usage_metadata.is_some() {
            self.usage = usage_from_metadata(chunk);
        }

        let parts = match chunk.candidates.first() {
            Some(c) => {
                if let Some(reason) = &c.finish_reason {
                    self.finish_reason = Some(reason.clone());
                }
                &c.content.parts
            }
            None => return events,
        };

        for part in parts {
            if part.thought == Some(true) {
                if self.block != OpenBlock::Thinking {
                    self.open_block(
                        OpenBlock::Thinking,
                        serde_json::json!({ "type": "thinking", "thinking": "" }),
                        &mut events,
                    );
                }
                if let Some(text) = &part.text {
                    events.push((
                        "content_block_delta",
                        serde_json::json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "thinking_delta", "thinking": text },
                        }),
                    ));
                }
                if let Some(sig) = part.thought_signature.as_deref().filter(|s| is_real_signature(s)) {
                    events.push((
                        "content_block_delta",
                        serde_json::json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "signature_delta", "signature": sig },
                        }),
                    ));
                }
                continue;
            }

            if let Some(fc) = &part.function_call {
                self.emit_tool_use(fc, part.thought_signature.as_deref(), &mut events);
                continue;
            }

            if let Some(text) = &part.text {
                if self.block != OpenBlock::Text {
                    self.open_block(
                        OpenBlock::Text,
                        serde_json::json!({ "type": "text", "text": "" }),
                        &mut events,
                    );
                }
                events.push((
                    "content_block_delta",
                    serde_json::json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "text_delta", "text": text },
                    }),
                ));
            }
        }

        events
    }

    fn emit_tool_use(
        &mut self,
        fc: &FunctionCall,
        signature: Option<&str>,
        events: &mut Vec<SseEvent>,
    ) {
        // A signed call that arrives without its own thinking block still
        // needs the signature replayed for the next turn.
        if let Some(sig) = signature.filter(|s| is_real_signature(s)) {
            if self.block != OpenBlock::Thinking {
                self.open_block(
                    OpenBlock::Thinking,
                    serde_json::json!({ "type": "thinking", "thinking": "" }),
                    events,
                );
            }
            events.push((
                "content_block_delta",
                serde_json::json!({
                    "type": "content_block_delta",
                    "index": self.block_index,
                    "delta": { "type": "signature_delta", "signature": sig },
                }),
            ));
        }

        self.saw_tool_use = true;
        let id = fc
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        self.open_block(
            OpenBlock::ToolUse,
            serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": fc.name,
                "input": {},
            }),
            events,
        );
        events.push((
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": { "type": "input_json_delta", "partial_json": fc.args.to_string() },
            }),
        ));
        self.close_block(events);
    }

    pub fn finish(mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.close_block(&mut events);
        let stop_reason = anthropic_stop_reason(self.finish_reason.as_deref(), self.saw_tool_use);
        events.push((
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": self.usage.output_tokens },
            }),
        ));
        events.push(("message_stop", serde_json::json!({ "type": "message_stop" })));
        events
    }

    pub fn error_event(message: &str) -> SseEvent {
        (
            "error",
            serde_json::json!({
                "type": "error",
                "error": { "type": "api_error", "message": message },
            }),
        )
    }
}

/// --- STREAMING: OPENAI CHUNKS ---

pub struct OpenAiStream {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    tool_index: u32,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    usage: Usage,
}

impl OpenAiStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            tool_index: 0,
            saw_tool_use: false,
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn on_chunk(&mut self, upstream: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();

        if upstream.usage_metadata.is_some() {
            self.usage = usage_from_metadata(upstream);
        }

        let parts = match upstream.candidates.first() {
            Some(c) => {
                if let Some(reason) = &c.finish_reason {
                    self.finish_reason = Some(reason.clone());
                }
                &c.content.parts
            }
            None => return out,
        };

        for part in parts {
            let mut delta = ChatDelta::default();
            if !self.sent_role {
                self.sent_role = true;
                delta.role = Some("assistant".to_string());
            }

            if part.thought == Some(true) {
                if let Some(text) = &part.text {
                    delta.reasoning_content = Some(text.clone());
                }
            } else if let Some(fc) = &part.function_call {
                self.saw_tool_use = true;
                delta.tool_calls = vec![ChatToolCallDelta {
                    index: self.tool_index,
                    id: Some(fc.id.clone().unwrap_or_else(|| {
                        format!("call_{}", uuid::Uuid::new_v4().simple())
                    })),
                    r#type: Some("function".to_string()),
                    function: Some(ChatFunctionCallDelta {
                        name: Some(fc.name.clone()),
                        arguments: Some(fc.args.to_string()),
                    }),
                }];
                self.tool_index += 1;
            } else if let Some(text) = &part.text {
                delta.content = Some(text.clone());
            } else {
                continue;
            }

            out.push(self.chunk(delta, None));
        }

        out
    }

    pub fn finish(self) -> ChatCompletionChunk {
        let finish = openai_finish_reason(self.finish_reason.as_deref(), self.saw_tool_use);
        let mut chunk = self.chunk(ChatDelta::default(), Some(finish.to_string()));
        chunk.usage = Some(ChatUsage {
            prompt_tokens: self.usage.input_tokens,
            completion_tokens: self.usage.output_tokens,
            total_tokens: self.usage.input_tokens + self.usage.output_tokens,
        });
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::google::{Candidate, Content, UsageMetadata};
    use serde_json::json;

    fn chunk_with_parts(parts: Vec<Part>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: "model".to_string(),
                    parts,
                },
                finish_reason: None,
                index: Some(0),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn consecutive_text_parts_merge() {
        let parts = vec![Part::text("Hello, "), Part::text("world")];
        let lifted = lift_response_parts(&parts);
        assert_eq!(lifted.len(), 1);
        assert!(matches!(
            &lifted[0],
            MessagePart::Text { content } if content == "Hello, world"
        ));
    }

    #[test]
    fn signed_function_call_grows_thinking_part() {
        let parts = vec![Part {
            function_call: Some(FunctionCall {
                id: Some("t1".into()),
                name: "get_time".into(),
                args: json!({}),
            }),
            thought_signature: Some("sig-1".into()),
            ..Default::default()
        }];
        let lifted = lift_response_parts(&parts);
        assert_eq!(lifted.len(), 2);
        assert!(matches!(
            &lifted[0],
            MessagePart::Thought { signature: Some(s), .. } if s == "sig-1"
        ));
        assert!(matches!(&lifted[1], MessagePart::ToolCall { id, .. } if id == "t1"));
    }

    #[test]
    fn sentinel_signature_is_not_replayed() {
        let parts = vec![Part {
            function_call: Some(FunctionCall {
                id: Some("t1".into()),
                name: "noop".into(),
                args: json!({}),
            }),
            thought_signature: Some(crate::constants::SKIP_SIGNATURE_SENTINEL.into()),
            ..Default::default()
        }];
        let lifted = lift_response_parts(&parts);
        assert_eq!(lifted.len(), 1);
        assert!(matches!(
            &lifted[0],
            MessagePart::ToolCall { thought_signature: None, .. }
        ));
    }

    #[test]
    fn batched_response_maps_stop_reason_and_usage() {
        let mut resp = chunk_with_parts(vec![Part::text("pong")]);
        resp.candidates[0].finish_reason = Some("STOP".into());
        resp.usage_metadata = Some(UsageMetadata {
            prompt_token_count: 10,
            candidates_token_count: 3,
            total_token_count: 13,
            cached_content_token_count: Some(8),
            thoughts_token_count: None,
        });

        let msg = to_anthropic_response(&resp, "claude-sonnet-4-5");
        assert_eq!(msg.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(msg.usage.input_tokens, 10);
        assert_eq!(msg.usage.cache_read_input_tokens, Some(8));
        assert!(matches!(&msg.content[0], ResponseBlock::Text { text } if text == "pong"));
    }

    #[test]
    fn openai_completion_extracts_tool_calls_and_reasoning() {
        let resp = chunk_with_parts(vec![
            Part {
                text: Some("planning".into()),
                thought: Some(true),
                ..Default::default()
            },
            Part {
                function_call: Some(FunctionCall {
                    id: Some("t9".into()),
                    name: "search".into(),
                    args: json!({"q": "rust"}),
                }),
                ..Default::default()
            },
        ]);

        let completion = to_openai_completion(&resp, "gemini-3-pro-preview");
        let message = &completion.choices[0].message;
        assert_eq!(message.reasoning_content.as_deref(), Some("planning"));
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].function.name, "search");
        assert_eq!(
            completion.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn anthropic_stream_emits_envelope_in_order() {
        let mut stream = AnthropicStream::new("claude-sonnet-4-5");
        let events = stream.on_chunk(&chunk_with_parts(vec![Part::text("po")]));
        let names: Vec<_> = events.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["message_start", "content_block_start", "content_block_delta"]
        );

        let events = stream.on_chunk(&chunk_with_parts(vec![Part::text("ng")]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["delta"]["text"], "ng");

        let finish = stream.finish();
        let names: Vec<_> = finish.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn openai_stream_emits_role_then_deltas() {
        let mut stream = OpenAiStream::new("claude-sonnet-4-5");
        let chunks = stream.on_chunk(&chunk_with_parts(vec![Part::text("po")]));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("po"));

        let chunks = stream.on_chunk(&chunk_with_parts(vec![Part::text("ng")]));
        assert!(chunks[0].choices[0].delta.role.is_none());
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("ng"));

        let last = stream.finish();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn remember_binds_signatures_to_family() {
        let cache = SignatureCache::new(16);
        let resp = chunk_with_parts(vec![Part {
            text: Some("hmm".into()),
            thought: Some(true),
            thought_signature: Some("sig-z".into()),
            ..Default::default()
        }]);
        remember_response_signatures(&resp, "sess", ModelFamily::Gemini, &cache);
        assert_eq!(cache.lookup("sess", "sig-z"), Some(ModelFamily::Gemini));
    }
}
