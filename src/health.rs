use crate::main_helper::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub accounts: usize,
    pub upstream_total: u64,
    pub upstream_failed: u64,
    pub consecutive_failures: u32,
}

pub async fn liveness(State(state): State<Arc<AppState>>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        accounts: state.client.pool().len().await,
        upstream_total: state.health.total_requests.load(Ordering::Relaxed),
        upstream_failed: state.health.failed_requests.load(Ordering::Relaxed),
        consecutive_failures: state.health.consecutive_failures.load(Ordering::Relaxed),
    })
}

/// Per-account, per-model cooldown state.
pub async fn account_limits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(denied) = check_webui_password(&state, &headers) {
        return denied;
    }
    (StatusCode::OK, Json(state.client.pool().snapshot().await))
}

pub async fn get_gateway_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(denied) = check_webui_password(&state, &headers) {
        return denied;
    }
    let config = state.config.get().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "systemInstruction": config.system_instruction })),
    )
}

pub async fn set_gateway_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(denied) = check_webui_password(&state, &headers) {
        return denied;
    }

    let Some(instruction) = payload
        .get("systemInstruction")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "systemInstruction is required" })),
        );
    };

    match state.config.set_system_instruction(instruction).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => (e.inner.status(), Json(serde_json::json!({ "error": e.to_string() }))),
    }
}

/// OpenAI-shaped model listing for the curated upstream models.
pub async fn list_models() -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = crate::constants::KNOWN_MODELS
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.family.to_string(),
                "capabilities": { "thinking": m.thinking, "image_generation": m.image },
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

fn check_webui_password(
    state: &AppState,
    headers: &HeaderMap,
) -> std::result::Result<(), (StatusCode, Json<serde_json::Value>)> {
    let Some(expected) = &state.webui_password else {
        return Ok(());
    };
    let provided = headers
        .get("x-webui-password")
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing or invalid x-webui-password" })),
        ))
    }
}
