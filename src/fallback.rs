//! Alternate-model policy for total pool exhaustion.
//!
//! The mapping crosses families on purpose (the other family draws from a
//! different quota) but never downgrades a thinking model to a non-thinking
//! one: a conversation carrying reasoning blocks would be rejected there.

use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    static ref FALLBACK_MODELS: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("claude-sonnet-4-5", "gemini-3-flash");
        map.insert("claude-sonnet-4-5-thinking", "gemini-3-pro-preview");
        map.insert("claude-opus-4-5-thinking", "gemini-3-pro-preview");
        map.insert("gemini-3-pro-preview", "claude-opus-4-5-thinking");
        map.insert("gemini-3-flash", "claude-sonnet-4-5");
        map.insert("gemini-2.5-flash", "claude-sonnet-4-5");
        map
    };
}

pub fn alternate_model(model: &str) -> Option<&'static str> {
    FALLBACK_MODELS.get(model).copied()
}
