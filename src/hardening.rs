//! Request hardening: the purity filter applied to outgoing upstream
//! payloads, and jitter for upstream-directed waits.

use serde_json::Value;
use std::time::Duration;

/// Strip `null` values and the literal string `"[undefined]"` from the
/// whole request tree. Buggy clients serialize absent fields both ways and
/// the upstream rejects either form.
pub fn strip_undefined(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !is_undefined(v));
            for (_, v) in map.iter_mut() {
                strip_undefined(v);
            }
        }
        Value::Array(arr) => {
            arr.retain(|v| !is_undefined(v));
            for v in arr.iter_mut() {
                strip_undefined(v);
            }
        }
        _ => {}
    }
}

fn is_undefined(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s == "[undefined]",
        _ => false,
    }
}

/// Apply ±25% jitter to an upstream-suggested wait so rotating clients do
/// not re-knock in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let base = delay.as_millis() as i64;
    let range = base / 4;
    let jitter = if range > 0 {
        fastrand::i64(-range..range)
    } else {
        0
    };
    Duration::from_millis((base + jitter).max(1) as u64)
}
