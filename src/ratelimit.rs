//! Rate-limit parsing: extract reset times and quota scope from upstream
//! 429 headers and error bodies.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

lazy_static! {
    /// `"retryDelay": "34s"` or `"retryDelay": "0.5s"` inside RPC error details.
    static ref RETRY_DELAY_RE: Regex =
        Regex::new(r#""retryDelay"\s*:\s*"(\d+(?:\.\d+)?)s""#).expect("static regex");
    /// `"resetAt": "2026-08-01T12:00:00Z"` style absolute reset stamps.
    static ref RESET_AT_RE: Regex =
        Regex::new(r#""resetAt"\s*:\s*"([^"]+)""#).expect("static regex");
}

/// Whether a 429 burned quota for the whole account or just for the endpoint
/// that served it. Endpoint-scoped limits are worth retrying on the next
/// host with the same account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Account,
    Endpoint,
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub retry_after: Option<Duration>,
    pub scope: RateLimitScope,
}

pub fn parse_rate_limit(headers: &reqwest::header::HeaderMap, body: &str) -> RateLimitInfo {
    let retry_after = header_retry_after(headers)
        .or_else(|| body_retry_delay(body))
        .or_else(|| body_reset_at(body));

    let scope = if body.contains("PerProjectPerRegion") || body.contains("per_endpoint") {
        RateLimitScope::Endpoint
    } else {
        RateLimitScope::Account
    };

    RateLimitInfo { retry_after, scope }
}

fn header_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn body_retry_delay(body: &str) -> Option<Duration> {
    let captures = RETRY_DELAY_RE.captures(body)?;
    let secs: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_millis((secs * 1000.0) as u64))
}

fn body_reset_at(body: &str) -> Option<Duration> {
    let captures = RESET_AT_RE.captures(body)?;
    let stamp = chrono::DateTime::parse_from_rfc3339(captures.get(1)?.as_str()).ok()?;
    let delta = stamp.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Explicit quota exhaustion: rotating further accounts will not help.
pub fn is_quota_exhausted(body: &str) -> bool {
    body.contains("QUOTA_EXHAUSTED")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_delay_from_body() {
        let body = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","details":[{"retryDelay":"34s"}]}}"#;
        let info = parse_rate_limit(&reqwest::header::HeaderMap::new(), body);
        assert_eq!(info.retry_after, Some(Duration::from_secs(34)));
        assert_eq!(info.scope, RateLimitScope::Account);
    }

    #[test]
    fn parses_fractional_retry_delay() {
        let body = r#"{"retryDelay":"0.5s"}"#;
        let info = parse_rate_limit(&reqwest::header::HeaderMap::new(), body);
        assert_eq!(info.retry_after, Some(Duration::from_millis(500)));
    }

    #[test]
    fn header_takes_precedence() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        let info = parse_rate_limit(&headers, r#"{"retryDelay":"34s"}"#);
        assert_eq!(info.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn region_quota_is_endpoint_scoped() {
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED","quotaId":"GenerateRequestsPerMinutePerProjectPerRegion"}}"#;
        let info = parse_rate_limit(&reqwest::header::HeaderMap::new(), body);
        assert_eq!(info.scope, RateLimitScope::Endpoint);
    }

    #[test]
    fn reset_at_in_the_future_yields_a_delay() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let body = format!(r#"{{"resetAt":"{}"}}"#, future.to_rfc3339());
        let info = parse_rate_limit(&reqwest::header::HeaderMap::new(), &body);
        let delay = info.retry_after.expect("delay parsed");
        assert!(delay > Duration::from_secs(80) && delay < Duration::from_secs(95));
    }

    #[test]
    fn missing_information_parses_to_none() {
        let info = parse_rate_limit(&reqwest::header::HeaderMap::new(), "too many requests");
        assert!(info.retry_after.is_none());
    }

    #[test]
    fn quota_exhaustion_detection() {
        assert!(is_quota_exhausted(r#"{"message":"QUOTA_EXHAUSTED"}"#));
        assert!(!is_quota_exhausted(r#"{"message":"slow down"}"#));
    }
}
