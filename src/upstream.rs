//! Cloud Code upstream client: request wrapping, endpoint failover,
//! account rotation, and first-chunk validation (peek-and-retry).
//!
//! The upstream is always called in streaming mode, even for callers that
//! asked for a single response, because the non-streaming path draws from a
//! tighter quota. Non-streaming callers get the chunks merged afterwards.

use crate::accounts::AccountPool;
use crate::constants::*;
use crate::fallback::alternate_model;
use crate::projections::GoogleProjection;
use crate::ratelimit::{self, RateLimitScope};
use crate::signatures::SignatureCache;
use crate::specs::google::*;
use crate::types::*;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<GenerateContentResponse>> + Send>>;

/// A validated upstream stream: the first chunk has already been peeked and
/// found non-empty before this is handed to a caller.
pub struct Served {
    pub account: String,
    pub model: String,
    pub stream: ChunkStream,
}

const MAX_STREAM_LINES: usize = 100_000;
const STREAM_CHANNEL_CAPACITY: usize = 32;

pub struct CloudCodeClient {
    http: reqwest::Client,
    pool: Arc<AccountPool>,
    health: Arc<UpstreamHealth>,
}

impl CloudCodeClient {
    pub fn new(http: reqwest::Client, pool: Arc<AccountPool>, health: Arc<UpstreamHealth>) -> Self {
        Self { http, pool, health }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    /// Issue `request` for `model`, rotating accounts on rate limits, auth
    /// failures, and silent streams, and iterating endpoints on transport
    /// errors, 404s, and endpoint-scoped 429s.
    pub async fn call(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        session_id: &str,
    ) -> Result<Served> {
        let mut request_value = serde_json::to_value(request).map_err(GatewayError::from)?;
        crate::hardening::strip_undefined(&mut request_value);

        let pool_size = self.pool.len().await;
        let max_attempts = MAX_UPSTREAM_ATTEMPTS.min(pool_size.max(1));
        let mut last_error: Option<ObservedError> = None;
        let mut tried: Vec<String> = Vec::new();

        for attempt in 0..max_attempts {
            let Some(email) = self.pool.pick_next(model, session_id, &tried).await else {
                break;
            };
            tried.push(email.clone());

            let (token, project) = match self.pool.get_token(&email).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(
                        "[upstream] token for {} unavailable on attempt {}/{}: {}",
                        email,
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            match self
                .call_account(model, &request_value, &email, &token, &project)
                .await
            {
                Ok(served) => {
                    self.health.record_success();
                    self.pool.record_success(&email, model).await;
                    return Ok(served);
                }
                Err(RotationVerdict::Rotate(e)) => {
                    self.health.record_failure();
                    tracing::warn!(
                        "[upstream] attempt {}/{} on {} failed: {}",
                        attempt + 1,
                        max_attempts,
                        email,
                        e
                    );
                    last_error = Some(e);
                }
                Err(RotationVerdict::Terminal(e)) => {
                    self.health.record_failure();
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::RateLimit(format!("no account available for model {}", model)).into()
        }))
    }

    /// One account's worth of work: walk the endpoint list, then peek the
    /// resulting stream.
    async fn call_account(
        &self,
        model: &str,
        request_value: &serde_json::Value,
        email: &str,
        token: &str,
        project: &str,
    ) -> std::result::Result<Served, RotationVerdict> {
        let envelope = UpstreamEnvelope {
            project: project.to_string(),
            model: model.to_string(),
            request: request_value.clone(),
            user_agent: UPSTREAM_USER_AGENT.to_string(),
            request_id: format!("{}-{}", REQUEST_ID_PREFIX, uuid::Uuid::new_v4()),
            request_type: request_type_for(model).to_string(),
        };

        let mut last_error: Option<ObservedError> = None;

        for endpoint in UPSTREAM_ENDPOINTS {
            let url = format!("{}{}", endpoint, UPSTREAM_STREAM_PATH);
            let mut request = self
                .http
                .post(&url)
                .bearer_auth(token)
                .header(reqwest::header::USER_AGENT, UPSTREAM_USER_AGENT)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&envelope);
            if ModelFamily::from_model(model) == ModelFamily::Claude && is_thinking_model(model) {
                request = request.header("anthropic-beta", INTERLEAVED_THINKING_BETA);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[upstream] {} unreachable: {}", endpoint, e);
                    last_error = Some(GatewayError::Transport(e.to_string()).into());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return match open_validated_stream(response).await {
                    Ok(stream) => Ok(Served {
                        account: email.to_string(),
                        model: model.to_string(),
                        stream,
                    }),
                    // A silent stream means this account/session pairing is
                    // wedged upstream; rotate rather than re-knock.
                    Err(e) => Err(RotationVerdict::Rotate(e)),
                };
            }

            if status.as_u16() == 404 {
                tracing::debug!("[upstream] {} does not serve {}", endpoint, model);
                last_error = Some(
                    GatewayError::Upstream(
                        axum::http::StatusCode::NOT_FOUND,
                        format!("model {} unknown at {}", model, endpoint),
                    )
                    .into(),
                );
                continue;
            }

            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                let info = ratelimit::parse_rate_limit(&headers, &body);
                if info.scope == RateLimitScope::Endpoint {
                    tracing::warn!("[upstream] endpoint quota at {}; trying next host", endpoint);
                    last_error = Some(GatewayError::RateLimit(body.clone()).into());
                    continue;
                }
                self.pool
                    .record_rate_limit(email, model, info.retry_after)
                    .await;
                if ratelimit::is_quota_exhausted(&body) {
                    // Explicit exhaustion: rotating would burn the rest of
                    // the pool for nothing.
                    return Err(RotationVerdict::Terminal(
                        GatewayError::RateLimit(body).into(),
                    ));
                }
                // A short upstream-suggested wait is worth riding out before
                // the next account takes over.
                if let Some(delay) = info.retry_after.filter(|d| *d <= Duration::from_secs(10)) {
                    tokio::time::sleep(crate::hardening::jittered(delay)).await;
                }
                return Err(RotationVerdict::Rotate(GatewayError::RateLimit(body).into()));
            }

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(RotationVerdict::Rotate(
                    GatewayError::Auth(format!("upstream {}: {}", status, body)).into(),
                ));
            }

            // Any other non-2xx propagates verbatim.
            return Err(RotationVerdict::Terminal(
                GatewayError::Upstream(
                    axum::http::StatusCode::from_u16(status.as_u16())
                        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
                    body,
                )
                .into(),
            ));
        }

        Err(RotationVerdict::Rotate(last_error.unwrap_or_else(|| {
            GatewayError::Transport("all endpoints unreachable".to_string()).into()
        })))
    }
}

enum RotationVerdict {
    /// Worth retrying with a different account.
    Rotate(ObservedError),
    /// Surfaced to the caller as-is.
    Terminal(ObservedError),
}

fn request_type_for(model: &str) -> &'static str {
    if ModelFamily::from_model(model) == ModelFamily::Gemini && is_image_model(model) {
        "image_gen"
    } else {
        "agent"
    }
}

/// --- STREAM OPENING AND PEEK ---

/// Each SSE datum is an envelope whose `response` field carries the actual
/// frame; bare frames are tolerated.
fn unwrap_datum(data: &str) -> Option<GenerateContentResponse> {
    if let Ok(enveloped) = serde_json::from_str::<EnvelopedResponse>(data) {
        return Some(enveloped.response);
    }
    match serde_json::from_str::<GenerateContentResponse>(data) {
        Ok(frame) if !frame.candidates.is_empty() || frame.usage_metadata.is_some() => Some(frame),
        _ => {
            tracing::debug!(
                "[stream] unrecognized datum: {}",
                crate::str_utils::truncate_for_log(data, 200)
            );
            None
        }
    }
}

fn chunk_has_content(chunk: &GenerateContentResponse) -> bool {
    chunk
        .candidates
        .iter()
        .any(|c| !c.content.parts.is_empty() || c.finish_reason.is_some())
}

/// Race the first chunk against the silence timeout; a closed, empty, or
/// stalled stream is an `Empty` error so the caller can retry elsewhere.
/// Once the first chunk validates, the rest is forwarded without peeking.
async fn open_validated_stream(response: reqwest::Response) -> Result<ChunkStream> {
    let bytes_stream = response
        .bytes_stream()
        .map(|r: reqwest::Result<Bytes>| r.map_err(std::io::Error::other));
    let mut lines = FramedRead::new(
        tokio_util::io::StreamReader::new(bytes_stream),
        LinesCodec::new_with_max_length(1024 * 1024),
    );

    let deadline = Duration::from_secs(FIRST_CHUNK_TIMEOUT_SECS);
    let first = tokio::time::timeout(deadline, async {
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    return Err::<Option<GenerateContentResponse>, ObservedError>(
                        GatewayError::Transport(format!("stream framing error: {}", e)).into(),
                    )
                }
            };
            if let Some(data) = line.strip_prefix("data: ") {
                if let Some(chunk) = unwrap_datum(data) {
                    return Ok(Some(chunk));
                }
            }
        }
        Ok(None)
    })
    .await;

    let first_chunk = match first {
        Err(_) => {
            return Err(GatewayError::Empty(format!(
                "no first chunk within {}s",
                FIRST_CHUNK_TIMEOUT_SECS
            ))
            .into())
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(None)) => {
            return Err(GatewayError::Empty("stream closed before first chunk".into()).into())
        }
        Ok(Ok(Some(chunk))) => {
            if !chunk_has_content(&chunk) {
                return Err(GatewayError::Empty("first chunk carried no content".into()).into());
            }
            chunk
        }
    };

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        if tx.send(Ok(first_chunk)).await.is_err() {
            return;
        }
        let mut line_count = 0usize;
        while let Some(line) = lines.next().await {
            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                let _ = tx
                    .send(Err(GatewayError::Transport(
                        "stream exceeded max line limit".to_string(),
                    )
                    .into()))
                    .await;
                return;
            }
            match line {
                Ok(line) => {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Some(chunk) = unwrap_datum(data) else {
                        continue;
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Caller went away: dropping `lines` cancels the
                        // upstream read.
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(GatewayError::Transport(format!(
                            "broken stream: {}",
                            e
                        ))
                        .into()))
                        .await;
                    return;
                }
            }
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// --- CHUNK MERGING (non-streaming callers) ---

/// First frame is the base; subsequent parts concatenate onto the first
/// candidate and the final usage report replaces earlier ones.
pub async fn collect_stream(mut stream: ChunkStream) -> Result<GenerateContentResponse> {
    let mut merged: Option<GenerateContentResponse> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        match merged.as_mut() {
            None => merged = Some(chunk),
            Some(base) => {
                if let Some(incoming) = chunk.candidates.into_iter().next() {
                    match base.candidates.first_mut() {
                        Some(candidate) => {
                            candidate.content.parts.extend(incoming.content.parts);
                            if incoming.finish_reason.is_some() {
                                candidate.finish_reason = incoming.finish_reason;
                            }
                        }
                        None => base.candidates.push(incoming),
                    }
                }
                if chunk.usage_metadata.is_some() {
                    base.usage_metadata = chunk.usage_metadata;
                }
            }
        }
    }

    merged.ok_or_else(|| GatewayError::Empty("upstream produced no chunks".into()).into())
}

/// --- DISPATCH (projection + fallback policy) ---

/// Project a lifted conversation for `model` and send it. When the pool has
/// nothing left for the model and fallback is enabled, the alternate model
/// is dispatched instead; the recursive call runs with fallback disabled so
/// a chain never exceeds one hop.
pub async fn dispatch_conversation(
    client: &CloudCodeClient,
    signatures: &SignatureCache,
    context: &ConversationContext,
    model: &str,
    system_instruction: Option<&str>,
    allow_fallback: bool,
) -> Result<Served> {
    let mut target = model.to_string();

    if !client.pool().has_available(&target).await && allow_fallback {
        if let Some(alternate) = alternate_model(&target) {
            tracing::warn!(
                "[dispatch] pool exhausted for {}; falling back to {}",
                target,
                alternate
            );
            target = alternate.to_string();
        }
    }

    let request = GoogleProjection::project(context, &target, system_instruction, signatures)?;
    client.call(&target, &request, &context.session_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn frame(text: &str) -> GenerateContentResponse {
        serde_json::from_value(json!({
            "candidates": [ { "content": { "role": "model", "parts": [ { "text": text } ] } } ]
        }))
        .expect("frame")
    }

    #[test]
    fn request_type_flags_image_models() {
        assert_eq!(request_type_for("gemini-3-pro-image-preview"), "image_gen");
        assert_eq!(request_type_for("gemini-3-flash"), "agent");
        assert_eq!(request_type_for("claude-sonnet-4-5"), "agent");
    }

    #[test]
    fn datum_unwraps_the_response_envelope() {
        let data = r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#;
        let chunk = unwrap_datum(data).expect("unwrapped");
        assert_eq!(chunk.candidates[0].content.parts[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn bare_frames_are_tolerated() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}"#;
        assert!(unwrap_datum(data).is_some());
        assert!(unwrap_datum("{}").is_none());
    }

    #[test]
    fn empty_chunks_fail_the_peek_validation() {
        let empty: GenerateContentResponse =
            serde_json::from_value(json!({ "candidates": [ { "content": { "role": "model", "parts": [] } } ] }))
                .expect("frame");
        assert!(!chunk_has_content(&empty));
        assert!(chunk_has_content(&frame("x")));
    }

    #[tokio::test]
    async fn collect_merges_parts_and_keeps_last_usage() {
        let mut second = frame("ng");
        second.usage_metadata = serde_json::from_value(json!({
            "promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7
        }))
        .ok();
        let chunks: Vec<Result<GenerateContentResponse>> =
            vec![Ok(frame("po")), Ok(second)];
        let stream: ChunkStream = Box::pin(stream::iter(chunks));

        let merged = collect_stream(stream).await.expect("merged");
        let parts = &merged.candidates[0].content.parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].text.as_deref(), Some("po"));
        assert_eq!(parts[1].text.as_deref(), Some("ng"));
        assert_eq!(merged.usage_metadata.unwrap().candidates_token_count, 2);
    }

    #[tokio::test]
    async fn collect_of_empty_stream_is_an_empty_error() {
        let stream: ChunkStream = Box::pin(stream::iter(Vec::<Result<GenerateContentResponse>>::new()));
        let err = collect_stream(stream).await.unwrap_err();
        assert!(matches!(err.inner, GatewayError::Empty(_)));
    }
}
