/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate a body for logging, appending an ellipsis when cut.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    let prefix = prefix_chars(s, max_chars);
    if prefix.len() < s.len() {
        format!("{}...", prefix)
    } else {
        s.to_string()
    }
}
