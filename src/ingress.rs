//! Ingress lifting: both public dialects are parsed into the internal
//! Anthropic-shaped hub before any upstream work happens.

use crate::constants::{MAX_HISTORY_LENGTH, MAX_MESSAGE_PARTS, MAX_TOOL_CALLS_PER_REQUEST};
use crate::specs::{anthropic, openai};
use crate::str_utils;
use crate::types::*;
use sha2::{Digest, Sha256};

/// Stable digest of the first user message's text parts. Used both to pick
/// a sticky account and as the upstream session key so prompt caching hits
/// across turns of the same conversation.
pub fn derive_session_id(history: &[TurnRecord]) -> String {
    let mut hasher = Sha256::new();
    if let Some(first_user) = history.iter().find(|t| t.role == Role::User) {
        for part in &first_user.content {
            if let MessagePart::Text { content } = part {
                hasher.update(content.as_bytes());
            }
        }
    }
    let hash = format!("{:x}", hasher.finalize());
    tracing::debug!(
        "[identify] session [{}...]",
        str_utils::prefix_chars(&hash, 8)
    );
    hash
}

/// --- ANTHROPIC DIALECT ---

pub fn lift_anthropic(req: &anthropic::MessagesRequest) -> Result<ConversationContext> {
    let mut history = Vec::with_capacity(req.messages.len());

    for (i, msg) in req.messages.iter().enumerate() {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(GatewayError::Translation(format!(
                    "messages[{}].role: unknown role '{}'",
                    i, other
                ))
                .into());
            }
        };

        let content = match &msg.content {
            anthropic::MessageContent::String(s) => vec![MessagePart::Text { content: s.clone() }],
            anthropic::MessageContent::Blocks(blocks) => lift_anthropic_blocks(blocks, i)?,
        };

        history.push(TurnRecord { role, content });
    }

    let tools = req
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| ToolDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let sampling = SamplingParams {
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop_sequences.clone().unwrap_or_default(),
        thinking_budget: req.thinking.as_ref().and_then(|t| {
            if t.type_ == "enabled" {
                Some(t.budget_tokens.unwrap_or(16_000))
            } else {
                None
            }
        }),
    };

    let session_id = derive_session_id(&history);
    let context = ConversationContext {
        history,
        session_id,
        system: req.system.as_ref().map(|s| s.to_text()),
        tools,
        tool_choice: req.tool_choice.clone(),
        sampling,
    };

    validate_context(&context)?;
    Ok(context)
}

fn lift_anthropic_blocks(
    blocks: &[anthropic::ContentBlock],
    index: usize,
) -> Result<Vec<MessagePart>> {
    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block {
            anthropic::ContentBlock::Text { text, .. } => {
                parts.push(MessagePart::Text {
                    content: text.clone(),
                });
            }
            anthropic::ContentBlock::Image { source } => {
                parts.push(MessagePart::Image {
                    url: source.url.clone(),
                    mime_type: source.media_type.clone(),
                    data: source.data.clone(),
                });
            }
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                if id.is_empty() {
                    return Err(GatewayError::Translation(format!(
                        "messages[{}]: tool_use block is missing an id",
                        index
                    ))
                    .into());
                }
                parts.push(MessagePart::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                    thought_signature: None,
                });
            }
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if tool_use_id.is_empty() {
                    return Err(GatewayError::Translation(format!(
                        "messages[{}]: tool_result block is missing a tool_use_id",
                        index
                    ))
                    .into());
                }
                parts.push(MessagePart::ToolResult {
                    tool_call_id: tool_use_id.clone(),
                    content: tool_result_text(content),
                    is_error: *is_error,
                    name: None,
                });
            }
            anthropic::ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                parts.push(MessagePart::Thought {
                    content: thinking.clone(),
                    signature: signature.clone(),
                });
            }
            anthropic::ContentBlock::RedactedThinking { .. } => {
                // Opaque to us and unverifiable across the translation; dropped.
                tracing::debug!("[lift] dropping redacted_thinking block at message {}", index);
            }
            anthropic::ContentBlock::Unknown => {}
        }
    }
    Ok(parts)
}

/// Tool results may carry a string or an array of content parts.
fn tool_result_text(content: &serde_json::Value) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    if let Some(arr) = content.as_array() {
        return arr
            .iter()
            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
    }
    if content.is_null() {
        return String::new();
    }
    content.to_string()
}

/// --- OPENAI DIALECT ---

pub fn lift_openai(req: &openai::ChatCompletionRequest) -> Result<ConversationContext> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut history: Vec<TurnRecord> = Vec::new();

    for (i, msg) in req.messages.iter().enumerate() {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = chat_content_text(&msg.content) {
                    system_parts.push(text);
                }
            }
            "user" => {
                history.push(TurnRecord {
                    role: Role::User,
                    content: lift_chat_content(&msg.content),
                });
            }
            "assistant" => {
                let mut parts = lift_chat_content(&msg.content);
                for tc in &msg.tool_calls {
                    if tc.id.is_empty() {
                        return Err(GatewayError::Translation(format!(
                            "messages[{}].tool_calls: tool call is missing an id",
                            i
                        ))
                        .into());
                    }
                    parts.push(MessagePart::ToolCall {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        arguments: parse_tool_arguments(&tc.function.name, &tc.function.arguments),
                        thought_signature: None,
                    });
                }
                coalesce_assistant(&mut history, parts);
            }
            "tool" => {
                let tool_call_id = msg.tool_call_id.clone().ok_or_else(|| {
                    GatewayError::Translation(format!(
                        "messages[{}]: role 'tool' requires a tool_call_id",
                        i
                    ))
                })?;
                let part = MessagePart::ToolResult {
                    tool_call_id,
                    content: chat_content_text(&msg.content).unwrap_or_default(),
                    is_error: false,
                    name: msg.name.clone(),
                };
                // Tool results fold into a user turn; consecutive ones share it.
                match history.last_mut() {
                    Some(last)
                        if last.role == Role::User
                            && last
                                .content
                                .iter()
                                .all(|p| matches!(p, MessagePart::ToolResult { .. })) =>
                    {
                        last.content.push(part);
                    }
                    _ => history.push(TurnRecord {
                        role: Role::User,
                        content: vec![part],
                    }),
                }
            }
            other => {
                return Err(GatewayError::Translation(format!(
                    "messages[{}].role: unknown role '{}'",
                    i, other
                ))
                .into());
            }
        }
    }

    let tools = lift_chat_tools(req);

    let sampling = SamplingParams {
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        stop_sequences: match &req.stop {
            Some(openai::StopSequences::String(s)) => vec![s.clone()],
            Some(openai::StopSequences::Array(v)) => v.clone(),
            None => Vec::new(),
        },
        thinking_budget: None,
    };

    let session_id = derive_session_id(&history);
    let context = ConversationContext {
        history,
        session_id,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        tools,
        tool_choice: req.tool_choice.as_ref().map(lift_chat_tool_choice),
        sampling,
    };

    validate_context(&context)?;
    Ok(context)
}

/// OpenAI tool_choice forms normalize to the internal (Anthropic-shaped)
/// representation the projection understands.
fn lift_chat_tool_choice(choice: &serde_json::Value) -> serde_json::Value {
    match choice.as_str() {
        Some("auto") => return serde_json::json!({ "type": "auto" }),
        Some("required") => return serde_json::json!({ "type": "any" }),
        Some("none") => return serde_json::json!({ "type": "none" }),
        _ => {}
    }
    if choice.get("type").and_then(|t| t.as_str()) == Some("function") {
        if let Some(name) = choice
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
        {
            return serde_json::json!({ "type": "tool", "name": name });
        }
    }
    choice.clone()
}

/// Consecutive assistant records merge into one turn, mirroring how the
/// dialects interleave text and tool calls.
fn coalesce_assistant(history: &mut Vec<TurnRecord>, parts: Vec<MessagePart>) {
    match history.last_mut() {
        Some(last) if last.role == Role::Assistant => last.content.extend(parts),
        _ => history.push(TurnRecord {
            role: Role::Assistant,
            content: parts,
        }),
    }
}

fn lift_chat_tools(req: &openai::ChatCompletionRequest) -> Vec<ToolDeclaration> {
    let mut tools = Vec::new();
    if let Some(declared) = &req.tools {
        for t in declared {
            tools.push(ToolDeclaration {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t.function.parameters.clone(),
            });
        }
    }
    // Legacy `functions` arrive the same way minus the wrapper object.
    if let Some(functions) = &req.functions {
        for f in functions {
            tools.push(ToolDeclaration {
                name: f.name.clone(),
                description: f.description.clone(),
                input_schema: f.parameters.clone(),
            });
        }
    }
    tools
}

fn lift_chat_content(content: &Option<openai::ChatContent>) -> Vec<MessagePart> {
    match content {
        None => Vec::new(),
        Some(openai::ChatContent::String(s)) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![MessagePart::Text { content: s.clone() }]
            }
        }
        Some(openai::ChatContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                openai::ChatContentPart::Text { text } => MessagePart::Text {
                    content: text.clone(),
                },
                openai::ChatContentPart::ImageUrl { image_url } => {
                    lift_image_url(&image_url.url)
                }
            })
            .collect(),
    }
}

/// Data URLs become inline image bytes; anything else stays a reference.
fn lift_image_url(url: &str) -> MessagePart {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return MessagePart::Image {
                url: None,
                mime_type: Some(mime.to_string()),
                data: Some(data.to_string()),
            };
        }
    }
    MessagePart::Image {
        url: Some(url.to_string()),
        mime_type: None,
        data: None,
    }
}

fn chat_content_text(content: &Option<openai::ChatContent>) -> Option<String> {
    match content {
        None => None,
        Some(openai::ChatContent::String(s)) => Some(s.clone()),
        Some(openai::ChatContent::Parts(parts)) => Some(
            parts
                .iter()
                .filter_map(|p| match p {
                    openai::ChatContentPart::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

/// Tool arguments arrive as a JSON string in the OpenAI dialect. Clients
/// occasionally send fragments; those degrade to an empty object rather
/// than failing the whole request.
fn parse_tool_arguments(name: &str, raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[lift] malformed arguments for tool '{}': {}", name, e);
            serde_json::json!({})
        }
    }
}

/// --- VALIDATION ---

pub fn validate_context(context: &ConversationContext) -> Result<()> {
    if context.history.is_empty() {
        return Err(GatewayError::Translation(
            "messages: request must contain at least one message".into(),
        )
        .into());
    }

    if context.history.len() > MAX_HISTORY_LENGTH {
        return Err(GatewayError::Translation(format!(
            "messages: history exceeds limit of {}",
            MAX_HISTORY_LENGTH
        ))
        .into());
    }

    let total_tool_calls: usize = context
        .history
        .iter()
        .map(|record| {
            record
                .content
                .iter()
                .filter(|part| matches!(part, MessagePart::ToolCall { .. }))
                .count()
        })
        .sum();

    if total_tool_calls > MAX_TOOL_CALLS_PER_REQUEST {
        return Err(GatewayError::Translation(format!(
            "messages: total tool calls ({}) exceeds limit of {}",
            total_tool_calls, MAX_TOOL_CALLS_PER_REQUEST
        ))
        .into());
    }

    for (i, record) in context.history.iter().enumerate() {
        if record.content.len() > MAX_MESSAGE_PARTS {
            return Err(GatewayError::Translation(format!(
                "messages[{}]: exceeds part limit of {}",
                i, MAX_MESSAGE_PARTS
            ))
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_turn(role: Role, text: &str) -> TurnRecord {
        TurnRecord {
            role,
            content: vec![MessagePart::Text {
                content: text.into(),
            }],
        }
    }

    #[test]
    fn session_id_is_stable_across_turns() {
        let one_turn = vec![text_turn(Role::User, "hello world")];
        let more_turns = vec![
            text_turn(Role::User, "hello world"),
            text_turn(Role::Assistant, "hi"),
            text_turn(Role::User, "next question"),
        ];
        assert_eq!(derive_session_id(&one_turn), derive_session_id(&more_turns));
    }

    #[test]
    fn session_id_differs_per_conversation() {
        let a = vec![text_turn(Role::User, "alpha")];
        let b = vec![text_turn(Role::User, "beta")];
        assert_ne!(derive_session_id(&a), derive_session_id(&b));
    }

    #[test]
    fn openai_tool_messages_fold_into_one_user_turn() {
        let req: openai::ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                { "role": "user", "content": "run both" },
                { "role": "assistant", "content": null, "tool_calls": [
                    { "id": "call_1", "type": "function",
                      "function": { "name": "a", "arguments": "{}" } },
                    { "id": "call_2", "type": "function",
                      "function": { "name": "b", "arguments": "{\"x\":1}" } }
                ]},
                { "role": "tool", "tool_call_id": "call_1", "content": "one" },
                { "role": "tool", "tool_call_id": "call_2", "content": "two" }
            ]
        }))
        .unwrap();

        let context = lift_openai(&req).unwrap();
        assert_eq!(context.history.len(), 3);
        let results = &context.history[2];
        assert_eq!(results.role, Role::User);
        assert_eq!(results.content.len(), 2);
    }

    #[test]
    fn openai_system_messages_concatenate() {
        let req: openai::ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-3-flash",
            "messages": [
                { "role": "system", "content": "first" },
                { "role": "system", "content": "second" },
                { "role": "user", "content": "hi" }
            ]
        }))
        .unwrap();

        let context = lift_openai(&req).unwrap();
        assert_eq!(context.system.as_deref(), Some("first\n\nsecond"));
    }

    #[test]
    fn tool_role_without_id_is_rejected() {
        let req: openai::ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-3-flash",
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "tool", "content": "orphan" }
            ]
        }))
        .unwrap();

        let err = lift_openai(&req).unwrap_err();
        assert!(err.to_string().contains("tool_call_id"));
    }

    #[test]
    fn unknown_role_names_the_field() {
        let req: openai::ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-3-flash",
            "messages": [ { "role": "narrator", "content": "hi" } ]
        }))
        .unwrap();

        let err = lift_openai(&req).unwrap_err();
        assert!(err.to_string().contains("messages[0].role"));
    }

    #[test]
    fn anthropic_thinking_blocks_lift_with_signature() {
        let req: anthropic::MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 1024,
            "messages": [
                { "role": "user", "content": "time?" },
                { "role": "assistant", "content": [
                    { "type": "thinking", "thinking": "need the clock", "signature": "s1" },
                    { "type": "tool_use", "id": "t1", "name": "get_time", "input": {} }
                ]}
            ]
        }))
        .unwrap();

        let context = lift_anthropic(&req).unwrap();
        let assistant = &context.history[1];
        assert!(matches!(
            &assistant.content[0],
            MessagePart::Thought { signature: Some(s), .. } if s == "s1"
        ));
        assert!(matches!(&assistant.content[1], MessagePart::ToolCall { id, .. } if id == "t1"));
    }

    #[test]
    fn openai_tool_choice_forms_normalize() {
        assert_eq!(
            lift_chat_tool_choice(&json!("required")),
            json!({ "type": "any" })
        );
        assert_eq!(
            lift_chat_tool_choice(&json!({ "type": "function", "function": { "name": "grep" } })),
            json!({ "type": "tool", "name": "grep" })
        );
        assert_eq!(lift_chat_tool_choice(&json!("auto")), json!({ "type": "auto" }));
    }

    #[test]
    fn data_url_images_become_inline_bytes() {
        let part = lift_image_url("data:image/png;base64,AAAA");
        assert!(matches!(
            part,
            MessagePart::Image { mime_type: Some(m), data: Some(d), url: None }
                if m == "image/png" && d == "AAAA"
        ));
    }
}
