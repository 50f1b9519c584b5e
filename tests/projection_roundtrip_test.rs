use antigravity_gateway::egress;
use antigravity_gateway::hardening::strip_undefined;
use antigravity_gateway::ingress;
use antigravity_gateway::projections::GoogleProjection;
use antigravity_gateway::signatures::SignatureCache;
use antigravity_gateway::specs::google::UpstreamEnvelope;
use antigravity_gateway::specs::{anthropic, openai};
use antigravity_gateway::types::*;
use serde_json::json;

#[test]
fn openai_text_request_projects_to_single_user_part() {
    let request: openai::ChatCompletionRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4-5",
        "messages": [ { "role": "user", "content": "ping" } ],
        "stream": false
    }))
    .unwrap();

    let context = ingress::lift_openai(&request).unwrap();
    let cache = SignatureCache::new(16);
    let projected =
        GoogleProjection::project(&context, "claude-sonnet-4-5", None, &cache).unwrap();

    assert_eq!(projected.contents.len(), 1);
    assert_eq!(projected.contents[0].role, "user");
    assert_eq!(projected.contents[0].parts.len(), 1);
    assert_eq!(projected.contents[0].parts[0].text.as_deref(), Some("ping"));
}

#[test]
fn anthropic_request_round_trips_through_google_dialect() {
    let request: anthropic::MessagesRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4-5-thinking",
        "max_tokens": 2048,
        "messages": [
            { "role": "user", "content": "read the config file" },
            { "role": "assistant", "content": [
                { "type": "thinking", "thinking": "need to open it first", "signature": "sig-rt" },
                { "type": "tool_use", "id": "toolu_1", "name": "read_file",
                  "input": { "path": "/etc/app.toml", "limit": 40 } }
            ]},
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "toolu_1", "content": "key = 1" }
            ]},
            { "role": "assistant", "content": "The config sets key to 1." }
        ]
    }))
    .unwrap();

    let context = ingress::lift_anthropic(&request).unwrap();
    let cache = SignatureCache::new(16);
    cache.remember(&context.session_id, "sig-rt", ModelFamily::Claude);

    let projected =
        GoogleProjection::project(&context, "claude-sonnet-4-5-thinking", None, &cache).unwrap();

    // Text content survives byte-for-byte.
    assert_eq!(
        projected.contents[0].parts[0].text.as_deref(),
        Some("read the config file")
    );
    assert_eq!(
        projected.contents[3].parts[0].text.as_deref(),
        Some("The config sets key to 1.")
    );

    // Lifting the projected assistant turn back recovers the hub parts,
    // with tool id, input, and ordering intact.
    let lifted_back = egress::lift_response_parts(&projected.contents[1].parts);
    assert_eq!(lifted_back, context.history[1].content);

    // The tool result kept its pairing.
    let response = projected.contents[2].parts[0]
        .function_response
        .as_ref()
        .expect("functionResponse part");
    assert_eq!(response.id.as_deref(), Some("toolu_1"));
    assert_eq!(response.name, "read_file");
    assert_eq!(response.response["result"], "key = 1");
}

#[test]
fn upstream_envelope_carries_exactly_the_contract_fields() {
    let envelope = UpstreamEnvelope {
        project: "proj-1".to_string(),
        model: "gemini-3-flash".to_string(),
        request: json!({ "contents": [] }),
        user_agent: "antigravity".to_string(),
        request_id: "agw-0000".to_string(),
        request_type: "agent".to_string(),
    };

    let value = serde_json::to_value(&envelope).unwrap();
    let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["model", "project", "request", "requestId", "requestType", "userAgent"]
    );
}

#[test]
fn purity_filter_cleans_the_whole_request_tree() {
    let request: openai::ChatCompletionRequest = serde_json::from_value(json!({
        "model": "gemini-3-flash",
        "messages": [ { "role": "user", "content": "hello [undefined] world" } ],
        "tools": [ { "type": "function", "function": {
            "name": "probe",
            "parameters": {
                "type": "object",
                "properties": { "mode": { "type": "string", "default": null } }
            }
        } } ]
    }))
    .unwrap();

    let context = ingress::lift_openai(&request).unwrap();
    let cache = SignatureCache::new(16);
    let projected = GoogleProjection::project(&context, "gemini-3-flash", None, &cache).unwrap();

    let mut tree = serde_json::to_value(&projected).unwrap();
    strip_undefined(&mut tree);

    fn assert_clean(value: &serde_json::Value) {
        match value {
            serde_json::Value::Null => panic!("null survived the purity filter"),
            serde_json::Value::String(s) => assert_ne!(s, "[undefined]"),
            serde_json::Value::Array(arr) => arr.iter().for_each(assert_clean),
            serde_json::Value::Object(map) => map.values().for_each(assert_clean),
            _ => {}
        }
    }
    assert_clean(&tree);

    // Text mentioning the marker inside a larger string is user content,
    // not a serialization bug, and must survive.
    assert!(tree["contents"][0]["parts"][0]["text"]
        .as_str()
        .unwrap()
        .contains("[undefined]"));
}

#[test]
fn sampling_params_map_onto_generation_config() {
    let request: anthropic::MessagesRequest = serde_json::from_value(json!({
        "model": "gemini-3-pro-preview",
        "max_tokens": 4096,
        "temperature": 0.3,
        "top_p": 0.9,
        "top_k": 40,
        "stop_sequences": ["STOP"],
        "thinking": { "type": "enabled", "budget_tokens": 20000 },
        "messages": [ { "role": "user", "content": "hi" } ]
    }))
    .unwrap();

    let context = ingress::lift_anthropic(&request).unwrap();
    let cache = SignatureCache::new(16);
    let projected =
        GoogleProjection::project(&context, "gemini-3-pro-preview", None, &cache).unwrap();

    let config = projected.generation_config.unwrap();
    assert_eq!(config.max_output_tokens, Some(4096));
    assert_eq!(config.temperature, Some(0.3));
    assert_eq!(config.top_p, Some(0.9));
    assert_eq!(config.top_k, Some(40));
    assert_eq!(config.stop_sequences, Some(vec!["STOP".to_string()]));
    assert!(config.candidate_count.is_none());
    let thinking = config.thinking_config.unwrap();
    assert_eq!(thinking.include_thoughts, Some(true));
    assert_eq!(thinking.thinking_budget, Some(20000));
}
