use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    /// Detect the serving family from a model identifier.
    pub fn from_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.contains("claude") {
            ModelFamily::Claude
        } else {
            ModelFamily::Gemini
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

pub fn is_thinking_model(model: &str) -> bool {
    model.contains("thinking")
        || crate::constants::KNOWN_MODELS
            .iter()
            .any(|m| m.id == model && m.thinking)
}

pub fn is_image_model(model: &str) -> bool {
    model.contains("image")
}

/// --- CORE ROLES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// --- THE HUB (Anthropic-shaped internal representation) ---
///
/// Both public dialects lift into this form; the Google projection reads
/// from it. Ordering inside a turn is significant: thinking parts precede
/// the tool calls they justify, and tool results mirror the prior
/// assistant's tool-call order.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationContext {
    pub history: Vec<TurnRecord>,
    pub session_id: String,
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    pub role: Role,
    pub content: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        content: String,
    },
    Image {
        url: Option<String>,
        mime_type: Option<String>,
        data: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
        name: Option<String>,
    },
    Thought {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u32>,
}

/// --- UPSTREAM HEALTH ---

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: std::sync::RwLock<Option<Instant>>,
    pub last_failure: std::sync::RwLock<Option<Instant>>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: std::sync::RwLock::new(None),
            last_failure: std::sync::RwLock::new(None),
        }
    }
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_failure.write() {
            *last = Some(Instant::now());
        }
    }
}

/// --- ERROR TAXONOMY ---

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Invalid request: {0}")]
    Translation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Empty upstream response: {0}")]
    Empty(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

impl GatewayError {
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            GatewayError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream(s, _) => *s,
            GatewayError::Translation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Transport(_) | GatewayError::Empty(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Serialization(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimit(_) => "rate_limit_error",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::Upstream(_, _) => "api_error",
            GatewayError::Translation(_) => "invalid_request_error",
            GatewayError::Transport(_) | GatewayError::Empty(_) => "overloaded_error",
            GatewayError::Serialization(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Anthropic-dialect error envelope.
    pub fn to_anthropic_body(&self) -> serde_json::Value {
        // Parseable upstream JSON errors are propagated verbatim.
        if let GatewayError::Upstream(_, body) = self {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
                if v.is_object() {
                    return v;
                }
            }
        }
        serde_json::json!({
            "type": "error",
            "error": { "type": self.code(), "message": self.to_string() }
        })
    }

    /// OpenAI-dialect error envelope.
    pub fn to_openai_body(&self) -> serde_json::Value {
        if let GatewayError::Upstream(_, body) = self {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
                if v.is_object() {
                    return v;
                }
            }
        }
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.code(),
                "code": self.status().as_u16(),
            }
        })
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: GatewayError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<GatewayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let status = self.inner.status();
        (status, axum::Json(self.inner.to_anthropic_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
