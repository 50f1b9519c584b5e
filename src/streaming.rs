//! Caller-facing SSE pumps. Upstream chunks are translated one-for-one in
//! arrival order; nothing is buffered beyond the bounded channel, so a slow
//! caller back-pressures the upstream reader instead of growing memory.

use crate::egress::{remember_response_signatures, AnthropicStream, OpenAiStream};
use crate::logging::StreamMetric;
use crate::signatures::SignatureCache;
use crate::types::ModelFamily;
use crate::upstream::Served;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type SseItem = std::result::Result<Event, Infallible>;

fn sse_response(rx: mpsc::Receiver<SseItem>) -> axum::response::Response {
    Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(": keepalive"),
        )
        .into_response()
}

/// Pump a validated upstream stream to the caller as Anthropic SSE events.
pub fn stream_anthropic_response(
    served: Served,
    session_id: String,
    signatures: Arc<SignatureCache>,
) -> axum::response::Response {
    let (tx, rx) = mpsc::channel::<SseItem>(100);
    let family = ModelFamily::from_model(&served.model);

    tokio::spawn(async move {
        let mut state = AnthropicStream::new(&served.model);
        let mut metrics = StreamMetric::new();
        let mut upstream = served.stream;
        let mut broke = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    remember_response_signatures(&chunk, &session_id, family, &signatures);
                    metrics.record_chunk(&chunk);
                    for (name, data) in state.on_chunk(&chunk) {
                        if send_event(&tx, name, &data).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    // Once chunks have been emitted the stream cannot be
                    // retried; close with a trailing error event instead.
                    tracing::error!("[stream] upstream broke mid-stream: {}", e);
                    let (name, data) = AnthropicStream::error_event(&e.to_string());
                    let _ = send_event(&tx, name, &data).await;
                    broke = true;
                    break;
                }
            }
        }

        if !broke {
            for (name, data) in state.finish() {
                if send_event(&tx, name, &data).await.is_err() {
                    return;
                }
            }
        }
        metrics.log_summary(&served.model);
    });

    sse_response(rx)
}

async fn send_event(
    tx: &mpsc::Sender<SseItem>,
    name: &'static str,
    data: &serde_json::Value,
) -> std::result::Result<(), ()> {
    let event = Event::default().event(name).data(data.to_string());
    tx.send(Ok(event)).await.map_err(|_| {
        tracing::trace!("[stream] caller disconnected");
    })
}

/// Pump a validated upstream stream to the caller as OpenAI chunk deltas,
/// closed by the `[DONE]` sentinel.
pub fn stream_openai_response(
    served: Served,
    session_id: String,
    signatures: Arc<SignatureCache>,
) -> axum::response::Response {
    let (tx, rx) = mpsc::channel::<SseItem>(100);
    let family = ModelFamily::from_model(&served.model);

    tokio::spawn(async move {
        let mut state = OpenAiStream::new(&served.model);
        let mut metrics = StreamMetric::new();
        let mut upstream = served.stream;
        let mut broke = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    remember_response_signatures(&chunk, &session_id, family, &signatures);
                    metrics.record_chunk(&chunk);
                    for delta in state.on_chunk(&chunk) {
                        if send_data(&tx, &delta).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("[stream] upstream broke mid-stream: {}", e);
                    let _ = send_data(&tx, &e.inner.to_openai_body()).await;
                    broke = true;
                    break;
                }
            }
        }

        if !broke {
            if send_data(&tx, &state.finish()).await.is_err() {
                return;
            }
        }
        let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
        metrics.log_summary(&served.model);
    });

    sse_response(rx)
}

async fn send_data<T: serde::Serialize>(
    tx: &mpsc::Sender<SseItem>,
    payload: &T,
) -> std::result::Result<(), ()> {
    let data = match serde_json::to_string(payload) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("[stream] chunk serialization failed: {}", e);
            return Err(());
        }
    };
    tx.send(Ok(Event::default().data(data)))
        .await
        .map_err(|_| {
            tracing::trace!("[stream] caller disconnected");
        })
}

/// Raw Google-dialect passthrough: enveloped frames are re-emitted as bare
/// `generateContent` chunks.
pub fn stream_google_response(served: Served) -> axum::response::Response {
    let (tx, rx) = mpsc::channel::<SseItem>(100);

    tokio::spawn(async move {
        let mut metrics = StreamMetric::new();
        let mut upstream = served.stream;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    metrics.record_chunk(&chunk);
                    if send_data(&tx, &chunk).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("[stream] upstream broke mid-stream: {}", e);
                    let _ = send_data(&tx, &e.inner.to_openai_body()).await;
                    break;
                }
            }
        }
        metrics.log_summary(&served.model);
    });

    sse_response(rx)
}
