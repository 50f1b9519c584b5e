//! Projection of the internal hub representation onto the upstream Google
//! generative-content dialect, including the model-family-specific thinking
//! protocol and the cross-model signature policy.

use crate::constants::SKIP_SIGNATURE_SENTINEL;
use crate::sanitize::sanitize_schema;
use crate::signatures::SignatureCache;
use crate::specs::google::*;
use crate::types::*;
use std::collections::HashMap;

/// Placeholder body for tool calls that were interrupted by a model switch.
const INTERRUPTED_TOOL_RESULT: &str =
    "Tool execution was interrupted before a result was produced.";

pub struct GoogleProjection;

impl GoogleProjection {
    /// Build the upstream request for `model` from a lifted conversation.
    ///
    /// `system_instruction` is the operator-configured preamble; it is
    /// prepended only when the conversation does not already carry it.
    pub fn project(
        context: &ConversationContext,
        model: &str,
        system_instruction: Option<&str>,
        signatures: &SignatureCache,
    ) -> Result<GenerateContentRequest> {
        let family = ModelFamily::from_model(model);
        let history = Self::repair_history(context, family, signatures);

        let tool_names = Self::tool_name_index(&history);
        let mut contents = Vec::with_capacity(history.len());
        for record in &history {
            match record.role {
                Role::User | Role::Tool => {
                    contents.push(Self::project_user_turn(record, &tool_names));
                }
                Role::Assistant => {
                    contents.push(Self::project_assistant_turn(
                        record,
                        family,
                        context,
                        signatures,
                    ));
                }
                Role::System => {
                    // System content arrives through `context.system`; a stray
                    // system turn degrades to user text.
                    contents.push(Content {
                        role: "user".to_string(),
                        parts: record
                            .content
                            .iter()
                            .filter_map(|p| match p {
                                MessagePart::Text { content } => Some(Part::text(content.clone())),
                                _ => None,
                            })
                            .collect(),
                    });
                }
            }
        }

        let system = Self::compose_system(context.system.as_deref(), system_instruction);

        Ok(GenerateContentRequest {
            contents,
            system_instruction: system.map(|text| Content {
                role: "user".to_string(),
                parts: vec![Part::text(text)],
            }),
            tools: Self::project_tools(&context.tools),
            tool_config: Self::project_tool_choice(context),
            generation_config: Some(Self::project_generation_config(&context.sampling, model)),
        })
    }

    /// The configured instruction is prepended exactly once.
    fn compose_system(request_system: Option<&str>, configured: Option<&str>) -> Option<String> {
        match (configured, request_system) {
            (Some(conf), Some(sys)) if sys.contains(conf) => Some(sys.to_string()),
            (Some(conf), Some(sys)) => Some(format!("{}\n\n{}", conf, sys)),
            (Some(conf), None) => Some(conf.to_string()),
            (None, Some(sys)) => Some(sys.to_string()),
            (None, None) => None,
        }
    }

    /// Repair pass over the transcript:
    /// - tool results are re-ordered to match the prior assistant's tool
    ///   calls, and results with no matching call are dropped;
    /// - every non-final tool call gets a placeholder result when the client
    ///   lost one;
    /// - a trailing open tool loop is closed with placeholder results when a
    ///   Gemini-signed history is re-targeted at a Claude model, so the
    ///   upstream sees a well-formed transcript.
    fn repair_history(
        context: &ConversationContext,
        family: ModelFamily,
        signatures: &SignatureCache,
    ) -> Vec<TurnRecord> {
        let mut history = context.history.clone();
        let mut pending_calls: Vec<(String, String)> = Vec::new();

        let last_index = history.len().saturating_sub(1);
        for (i, record) in history.iter_mut().enumerate() {
            match record.role {
                Role::Assistant => {
                    pending_calls = record
                        .content
                        .iter()
                        .filter_map(|p| match p {
                            MessagePart::ToolCall { id, name, .. } => {
                                Some((id.clone(), name.clone()))
                            }
                            _ => None,
                        })
                        .collect();
                }
                Role::User | Role::Tool => {
                    if pending_calls.is_empty() {
                        continue;
                    }
                    Self::align_tool_results(record, &pending_calls, i < last_index);
                    pending_calls.clear();
                }
                Role::System => {}
            }
        }

        // A trailing assistant turn that still awaits results is the normal
        // pending state, except across a Gemini-to-Claude switch where the
        // new upstream would reject the open loop.
        if !pending_calls.is_empty() && family == ModelFamily::Claude {
            let history_sigs = collect_history_signatures(&context.history);
            let crossed = signatures.has_family(
                &context.session_id,
                history_sigs.iter().map(|s| s.as_str()),
                ModelFamily::Gemini,
            );
            if crossed {
                tracing::info!(
                    "[project] closing {} interrupted tool call(s) after model switch",
                    pending_calls.len()
                );
                history.push(TurnRecord {
                    role: Role::User,
                    content: pending_calls
                        .iter()
                        .map(|(id, name)| MessagePart::ToolResult {
                            tool_call_id: id.clone(),
                            content: INTERRUPTED_TOOL_RESULT.to_string(),
                            is_error: false,
                            name: Some(name.clone()),
                        })
                        .collect(),
                });
            }
        }

        history
    }

    /// Reorder this turn's tool results to the order of `calls`; drop
    /// results that answer nothing, synthesize placeholders for calls that
    /// lost their answer (only for settled turns).
    fn align_tool_results(record: &mut TurnRecord, calls: &[(String, String)], settled: bool) {
        let mut results: HashMap<String, MessagePart> = HashMap::new();
        let mut rest: Vec<MessagePart> = Vec::new();

        for part in record.content.drain(..) {
            match part {
                MessagePart::ToolResult { ref tool_call_id, .. } => {
                    let id = tool_call_id.clone();
                    if calls.iter().any(|(call_id, _)| *call_id == id) {
                        results.insert(id, part);
                    } else {
                        tracing::warn!(
                            "[repair] dropping tool_result '{}' with no matching tool_use",
                            id
                        );
                    }
                }
                other => rest.push(other),
            }
        }

        let mut ordered = Vec::with_capacity(calls.len() + rest.len());
        for (id, name) in calls {
            match results.remove(id) {
                Some(part) => ordered.push(part),
                None if settled => {
                    tracing::warn!("[repair] synthesizing missing tool_result for '{}'", id);
                    ordered.push(MessagePart::ToolResult {
                        tool_call_id: id.clone(),
                        content: INTERRUPTED_TOOL_RESULT.to_string(),
                        is_error: false,
                        name: Some(name.clone()),
                    });
                }
                None => {}
            }
        }
        ordered.extend(rest);
        record.content = ordered;
    }

    fn tool_name_index(history: &[TurnRecord]) -> HashMap<String, String> {
        let mut index = HashMap::new();
        for record in history {
            for part in &record.content {
                if let MessagePart::ToolCall { id, name, .. } = part {
                    index.insert(id.clone(), name.clone());
                }
            }
        }
        index
    }

    fn project_user_turn(record: &TurnRecord, tool_names: &HashMap<String, String>) -> Content {
        let mut parts = Vec::with_capacity(record.content.len());
        for part in &record.content {
            match part {
                MessagePart::Text { content } => parts.push(Part::text(content.clone())),
                MessagePart::Image {
                    mime_type: Some(mime),
                    data: Some(data),
                    ..
                } => parts.push(Part {
                    inline_data: Some(InlineData {
                        mime_type: mime.clone(),
                        data: data.clone(),
                    }),
                    ..Default::default()
                }),
                MessagePart::Image { url: Some(url), .. } => {
                    tracing::warn!("[project] dropping URL-only image part: {}", url);
                }
                MessagePart::Image { .. } => {}
                MessagePart::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                    name,
                } => {
                    let function_name = name
                        .clone()
                        .or_else(|| tool_names.get(tool_call_id).cloned())
                        .unwrap_or_else(|| format!("unknown_tool_{}", tool_call_id));
                    let response = if *is_error {
                        serde_json::json!({ "error": content })
                    } else {
                        serde_json::json!({ "result": content })
                    };
                    parts.push(Part {
                        function_response: Some(FunctionResponse {
                            id: Some(tool_call_id.clone()),
                            name: function_name,
                            response,
                        }),
                        ..Default::default()
                    });
                }
                // Thinking and tool calls never occur on the user side.
                MessagePart::Thought { .. } | MessagePart::ToolCall { .. } => {}
            }
        }
        if parts.is_empty() {
            // The upstream rejects contents without parts.
            parts.push(Part::text(" "));
        }
        Content {
            role: "user".to_string(),
            parts,
        }
    }

    fn project_assistant_turn(
        record: &TurnRecord,
        family: ModelFamily,
        context: &ConversationContext,
        signatures: &SignatureCache,
    ) -> Content {
        let mut parts = Vec::with_capacity(record.content.len());
        let mut pending_signature: Option<String> = None;

        for part in &record.content {
            match part {
                MessagePart::Text { content } => parts.push(Part::text(content.clone())),
                MessagePart::Thought { content, signature } => match family {
                    ModelFamily::Gemini => {
                        // Gemini carries reasoning on the next function call;
                        // the thought text itself is not replayed.
                        pending_signature = signature.clone();
                    }
                    ModelFamily::Claude => {
                        let foreign = signature.as_deref().map(|sig| {
                            signatures.lookup(&context.session_id, sig)
                                == Some(ModelFamily::Gemini)
                        });
                        if foreign == Some(true) {
                            tracing::debug!("[project] dropping foreign thinking block");
                            continue;
                        }
                        parts.push(Part {
                            text: Some(content.clone()),
                            thought: Some(true),
                            thought_signature: signature.clone(),
                            ..Default::default()
                        });
                    }
                },
                MessagePart::ToolCall {
                    id,
                    name,
                    arguments,
                    thought_signature,
                } => {
                    let carried = thought_signature
                        .clone()
                        .or_else(|| pending_signature.take());
                    let projected_signature = match family {
                        ModelFamily::Gemini => Some(Self::gemini_signature(
                            carried.as_deref(),
                            &context.session_id,
                            signatures,
                        )),
                        ModelFamily::Claude => carried.filter(|sig| {
                            signatures.lookup(&context.session_id, sig)
                                != Some(ModelFamily::Gemini)
                        }),
                    };
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            id: Some(id.clone()),
                            name: name.clone(),
                            args: arguments.clone(),
                        }),
                        thought_signature: projected_signature,
                        ..Default::default()
                    });
                }
                // Tool results and images never occur on the assistant side.
                MessagePart::ToolResult { .. } | MessagePart::Image { .. } => {}
            }
        }

        if parts.is_empty() {
            parts.push(Part::text(" "));
        }
        Content {
            role: "model".to_string(),
            parts,
        }
    }

    /// A Gemini target only accepts signatures it minted itself; everything
    /// else is replaced by the documented skip-validation marker. Tool calls
    /// with no thinking at all keep no signature.
    fn gemini_signature(
        carried: Option<&str>,
        session_id: &str,
        signatures: &SignatureCache,
    ) -> String {
        match carried {
            Some(sig) if signatures.lookup(session_id, sig) == Some(ModelFamily::Gemini) => {
                sig.to_string()
            }
            _ => SKIP_SIGNATURE_SENTINEL.to_string(),
        }
    }

    fn project_tools(tools: &[ToolDeclaration]) -> Option<Vec<Tool>> {
        if tools.is_empty() {
            return None;
        }
        Some(vec![Tool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: sanitize_schema(&t.input_schema),
                })
                .collect(),
        }])
    }

    fn project_tool_choice(context: &ConversationContext) -> Option<ToolConfig> {
        if context.tools.is_empty() {
            return None;
        }
        let (mode, allowed) = match context.tool_choice.as_ref() {
            Some(choice) => match choice.get("type").and_then(|t| t.as_str()) {
                Some("any") | Some("required") => ("ANY", None),
                Some("none") => ("NONE", None),
                Some("tool") => (
                    "ANY",
                    choice
                        .get("name")
                        .and_then(|n| n.as_str())
                        .map(|n| vec![n.to_string()]),
                ),
                _ => ("AUTO", None),
            },
            None => ("AUTO", None),
        };
        Some(ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: mode.to_string(),
                allowed_function_names: allowed,
            },
        })
    }

    fn project_generation_config(sampling: &SamplingParams, model: &str) -> GenerationConfig {
        let thinking_config = if is_thinking_model(model) {
            Some(ThinkingConfig {
                include_thoughts: Some(true),
                thinking_budget: sampling.thinking_budget,
            })
        } else {
            None
        };
        GenerationConfig {
            max_output_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            stop_sequences: if sampling.stop_sequences.is_empty() {
                None
            } else {
                Some(sampling.stop_sequences.clone())
            },
            // Never forwarded; the upstream only serves one candidate.
            candidate_count: None,
            thinking_config,
        }
    }
}

/// Every signature present anywhere in the transcript.
pub fn collect_history_signatures(history: &[TurnRecord]) -> Vec<String> {
    let mut sigs = Vec::new();
    for record in history {
        for part in &record.content {
            match part {
                MessagePart::Thought {
                    signature: Some(sig),
                    ..
                } => sigs.push(sig.clone()),
                MessagePart::ToolCall {
                    thought_signature: Some(sig),
                    ..
                } => sigs.push(sig.clone()),
                _ => {}
            }
        }
    }
    sigs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_with(history: Vec<TurnRecord>) -> ConversationContext {
        let session_id = crate::ingress::derive_session_id(&history);
        ConversationContext {
            history,
            session_id,
            system: None,
            tools: Vec::new(),
            tool_choice: None,
            sampling: SamplingParams::default(),
        }
    }

    fn thinking_tool_history(signature: &str) -> Vec<TurnRecord> {
        vec![
            TurnRecord {
                role: Role::User,
                content: vec![MessagePart::Text {
                    content: "what time is it".into(),
                }],
            },
            TurnRecord {
                role: Role::Assistant,
                content: vec![
                    MessagePart::Thought {
                        content: "check the clock".into(),
                        signature: Some(signature.into()),
                    },
                    MessagePart::ToolCall {
                        id: "t1".into(),
                        name: "get_time".into(),
                        arguments: json!({}),
                        thought_signature: None,
                    },
                ],
            },
        ]
    }

    #[test]
    fn known_gemini_signature_is_kept() {
        let cache = SignatureCache::new(16);
        let context = context_with(thinking_tool_history("sig-g"));
        cache.remember(&context.session_id, "sig-g", ModelFamily::Gemini);

        let req =
            GoogleProjection::project(&context, "gemini-3-pro-preview", None, &cache).unwrap();
        let call_part = &req.contents[1].parts[0];
        assert_eq!(call_part.thought_signature.as_deref(), Some("sig-g"));
        assert_eq!(
            call_part.function_call.as_ref().map(|f| f.name.as_str()),
            Some("get_time")
        );
    }

    #[test]
    fn foreign_signature_becomes_sentinel_on_gemini() {
        let cache = SignatureCache::new(16);
        let context = context_with(thinking_tool_history("sig-c"));
        cache.remember(&context.session_id, "sig-c", ModelFamily::Claude);

        let req =
            GoogleProjection::project(&context, "gemini-3-pro-preview", None, &cache).unwrap();
        assert_eq!(
            req.contents[1].parts[0].thought_signature.as_deref(),
            Some(SKIP_SIGNATURE_SENTINEL)
        );
    }

    #[test]
    fn claude_target_replays_thinking_blocks() {
        let cache = SignatureCache::new(16);
        let context = context_with(thinking_tool_history("sig-c"));
        cache.remember(&context.session_id, "sig-c", ModelFamily::Claude);

        let req =
            GoogleProjection::project(&context, "claude-sonnet-4-5-thinking", None, &cache)
                .unwrap();
        let assistant = &req.contents[1];
        assert_eq!(assistant.parts.len(), 2);
        assert_eq!(assistant.parts[0].thought, Some(true));
        assert_eq!(assistant.parts[0].thought_signature.as_deref(), Some("sig-c"));
    }

    #[test]
    fn gemini_to_claude_switch_closes_open_tool_loop() {
        let cache = SignatureCache::new(16);
        let context = context_with(thinking_tool_history("sig-g"));
        cache.remember(&context.session_id, "sig-g", ModelFamily::Gemini);

        let req =
            GoogleProjection::project(&context, "claude-sonnet-4-5", None, &cache).unwrap();

        // A synthesized user turn answers the open call.
        let last = req.contents.last().unwrap();
        assert_eq!(last.role, "user");
        let response = last.parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.id.as_deref(), Some("t1"));

        // And no Gemini signature survives anywhere in the transcript.
        for content in &req.contents {
            for part in &content.parts {
                assert_ne!(part.thought_signature.as_deref(), Some("sig-g"));
            }
        }
    }

    #[test]
    fn out_of_order_tool_results_are_reordered() {
        let history = vec![
            TurnRecord {
                role: Role::User,
                content: vec![MessagePart::Text { content: "go".into() }],
            },
            TurnRecord {
                role: Role::Assistant,
                content: vec![
                    MessagePart::ToolCall {
                        id: "a".into(),
                        name: "first".into(),
                        arguments: json!({}),
                        thought_signature: None,
                    },
                    MessagePart::ToolCall {
                        id: "b".into(),
                        name: "second".into(),
                        arguments: json!({}),
                        thought_signature: None,
                    },
                ],
            },
            TurnRecord {
                role: Role::User,
                content: vec![
                    MessagePart::ToolResult {
                        tool_call_id: "b".into(),
                        content: "two".into(),
                        is_error: false,
                        name: None,
                    },
                    MessagePart::ToolResult {
                        tool_call_id: "zzz".into(),
                        content: "orphan".into(),
                        is_error: false,
                        name: None,
                    },
                    MessagePart::ToolResult {
                        tool_call_id: "a".into(),
                        content: "one".into(),
                        is_error: false,
                        name: None,
                    },
                ],
            },
            TurnRecord {
                role: Role::Assistant,
                content: vec![MessagePart::Text { content: "done".into() }],
            },
        ];
        let context = context_with(history);
        let cache = SignatureCache::new(16);

        let req = GoogleProjection::project(&context, "gemini-3-flash", None, &cache).unwrap();
        let results = &req.contents[2].parts;
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].function_response.as_ref().unwrap().id.as_deref(),
            Some("a")
        );
        assert_eq!(
            results[1].function_response.as_ref().unwrap().id.as_deref(),
            Some("b")
        );
    }

    #[test]
    fn configured_instruction_prepends_once() {
        let mut context = context_with(vec![TurnRecord {
            role: Role::User,
            content: vec![MessagePart::Text { content: "hi".into() }],
        }]);
        context.system = Some("Be terse.".into());
        let cache = SignatureCache::new(16);

        let req = GoogleProjection::project(
            &context,
            "gemini-3-flash",
            Some("You are Antigravity."),
            &cache,
        )
        .unwrap();
        let sys = req.system_instruction.as_ref().unwrap().parts[0]
            .text
            .clone()
            .unwrap();
        assert!(sys.starts_with("You are Antigravity."));
        assert!(sys.ends_with("Be terse."));

        // Already present: not duplicated.
        context.system = Some("You are Antigravity. Be terse.".into());
        let req = GoogleProjection::project(
            &context,
            "gemini-3-flash",
            Some("You are Antigravity."),
            &cache,
        )
        .unwrap();
        let sys = req.system_instruction.as_ref().unwrap().parts[0]
            .text
            .clone()
            .unwrap();
        assert_eq!(sys.matches("You are Antigravity.").count(), 1);
    }

    #[test]
    fn tool_choice_maps_to_function_calling_mode() {
        let mut context = context_with(vec![TurnRecord {
            role: Role::User,
            content: vec![MessagePart::Text { content: "hi".into() }],
        }]);
        context.tools = vec![ToolDeclaration {
            name: "lookup".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        }];
        context.tool_choice = Some(json!({"type": "tool", "name": "lookup"}));
        let cache = SignatureCache::new(16);

        let req = GoogleProjection::project(&context, "gemini-3-flash", None, &cache).unwrap();
        let config = req.tool_config.unwrap().function_calling_config;
        assert_eq!(config.mode, "ANY");
        assert_eq!(config.allowed_function_names, Some(vec!["lookup".into()]));
    }
}
