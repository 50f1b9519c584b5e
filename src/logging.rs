use crate::specs::google::GenerateContentResponse;
use colored::*;
use std::panic;
use tracing::{error, info, warn};

/// Sets up a global panic hook that logs panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// One-line ingress summary, useful when tailing the log next to a client.
pub fn log_request_summary(dialect: &str, model: &str, message_count: usize, streaming: bool) {
    info!(
        target: "flight_recorder",
        "[REQ] Dialect: {} | Model: {} | Messages: {} | Stream: {}",
        dialect, model, message_count, streaming
    );
}

#[derive(Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub tokens: usize,
    pub tool_parts: usize,
    pub text_chars: usize,
    pub thought_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, chunk: &GenerateContentResponse) {
        self.chunks += 1;
        if let Some(usage) = &chunk.usage_metadata {
            self.tokens = usage.total_token_count as usize;
        }
        for candidate in &chunk.candidates {
            for part in &candidate.content.parts {
                if let Some(text) = &part.text {
                    if part.thought == Some(true) {
                        self.thought_chars += text.len();
                    } else {
                        self.text_chars += text.len();
                    }
                }
                if let Some(fc) = &part.function_call {
                    self.tool_parts += 1;
                    self.tool_names.push(fc.name.clone());
                }
            }
        }
    }

    pub fn log_summary(&self, model: &str) {
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };

        if self.chunks > 0 && self.text_chars == 0 && self.tool_parts == 0 {
            warn!(
                target: "flight_recorder",
                "{}", "[STREAM END] stream carried thoughts or usage only".bold().yellow()
            );
        }

        info!(
            target: "flight_recorder",
            "[STREAM END] Model: {} | Chunks: {} | Tools: {} | Text: {} chars | Thought: {} chars | Tokens: {}",
            model, self.chunks, tools_str, self.text_chars, self.thought_chars, self.tokens
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metrics_count_text_and_tools() {
        let chunk: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [ { "content": { "role": "model", "parts": [
                { "text": "hello" },
                { "text": "mull", "thought": true },
                { "functionCall": { "name": "grep", "args": {} } }
            ] } } ],
            "usageMetadata": { "promptTokenCount": 1, "candidatesTokenCount": 2, "totalTokenCount": 3 }
        }))
        .unwrap();

        let mut metric = StreamMetric::new();
        metric.record_chunk(&chunk);

        assert_eq!(metric.chunks, 1);
        assert_eq!(metric.text_chars, 5);
        assert_eq!(metric.thought_chars, 4);
        assert_eq!(metric.tool_parts, 1);
        assert_eq!(metric.tokens, 3);
        assert_eq!(metric.tool_names, vec!["grep".to_string()]);
    }
}
