use antigravity_gateway::accounts::AccountPool;
use antigravity_gateway::config::GatewayConfigStore;
use antigravity_gateway::egress;
use antigravity_gateway::ingress;
use antigravity_gateway::logging;
use antigravity_gateway::signatures::SignatureCache;
use antigravity_gateway::specs::google::GenerateContentRequest;
use antigravity_gateway::specs::{anthropic, openai};
use antigravity_gateway::streaming;
use antigravity_gateway::types::*;
use antigravity_gateway::upstream::{self, CloudCodeClient};
use antigravity_gateway::{AppState, Args, Settings};

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::Instrument;
use tracing_subscriber::prelude::*;

/// --- DIALECT HANDLERS ---

fn openai_error(e: ObservedError) -> Response {
    (e.inner.status(), Json(e.inner.to_openai_body())).into_response()
}

fn anthropic_error(e: ObservedError) -> Response {
    (e.inner.status(), Json(e.inner.to_anthropic_body())).into_response()
}

#[tracing::instrument(
    name = "gateway.request",
    skip_all,
    fields(dialect = "openai", model = tracing::field::Empty, session = tracing::field::Empty)
)]
async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    if state.debug {
        tracing::debug!(
            "[ingress] payload: {}",
            antigravity_gateway::str_utils::truncate_for_log(&payload.to_string(), 2000)
        );
    }
    let request: openai::ChatCompletionRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return openai_error(
                GatewayError::Translation(format!("payload deserialization failed: {}", e)).into(),
            )
        }
    };

    let span = tracing::Span::current();
    span.record("model", request.model.as_str());

    let context = match ingress::lift_openai(&request) {
        Ok(c) => c,
        Err(e) => return openai_error(e),
    };
    span.record("session", antigravity_gateway::str_utils::prefix_chars(&context.session_id, 8));
    logging::log_request_summary("openai", &request.model, request.messages.len(), request.stream);

    let system_instruction = state.config.system_instruction().await;
    let served = match upstream::dispatch_conversation(
        &state.client,
        &state.signatures,
        &context,
        &request.model,
        system_instruction.as_deref(),
        state.fallback_enabled,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => return openai_error(e),
    };

    if request.stream {
        streaming::stream_openai_response(served, context.session_id, state.signatures.clone())
    } else {
        let model = served.model.clone();
        match upstream::collect_stream(served.stream).await {
            Ok(merged) => {
                egress::remember_response_signatures(
                    &merged,
                    &context.session_id,
                    ModelFamily::from_model(&model),
                    &state.signatures,
                );
                Json(egress::to_openai_completion(&merged, &model)).into_response()
            }
            Err(e) => openai_error(e),
        }
    }
}

#[tracing::instrument(
    name = "gateway.request",
    skip_all,
    fields(dialect = "anthropic", model = tracing::field::Empty, session = tracing::field::Empty)
)]
async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    if state.debug {
        tracing::debug!(
            "[ingress] payload: {}",
            antigravity_gateway::str_utils::truncate_for_log(&payload.to_string(), 2000)
        );
    }
    let request: anthropic::MessagesRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return anthropic_error(
                GatewayError::Translation(format!("payload deserialization failed: {}", e)).into(),
            )
        }
    };

    let span = tracing::Span::current();
    span.record("model", request.model.as_str());

    let context = match ingress::lift_anthropic(&request) {
        Ok(c) => c,
        Err(e) => return anthropic_error(e),
    };
    span.record("session", antigravity_gateway::str_utils::prefix_chars(&context.session_id, 8));
    logging::log_request_summary(
        "anthropic",
        &request.model,
        request.messages.len(),
        request.stream,
    );

    let system_instruction = state.config.system_instruction().await;
    let served = match upstream::dispatch_conversation(
        &state.client,
        &state.signatures,
        &context,
        &request.model,
        system_instruction.as_deref(),
        state.fallback_enabled,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => return anthropic_error(e),
    };

    if request.stream {
        streaming::stream_anthropic_response(served, context.session_id, state.signatures.clone())
    } else {
        let model = served.model.clone();
        match upstream::collect_stream(served.stream).await {
            Ok(merged) => {
                egress::remember_response_signatures(
                    &merged,
                    &context.session_id,
                    ModelFamily::from_model(&model),
                    &state.signatures,
                );
                Json(egress::to_anthropic_response(&merged, &model)).into_response()
            }
            Err(e) => anthropic_error(e),
        }
    }
}

/// Google-native passthrough. The path carries `{model}:{operation}`.
#[tracing::instrument(
    name = "gateway.request",
    skip_all,
    fields(dialect = "google", model = tracing::field::Empty)
)]
async fn google_handler(
    State(state): State<Arc<AppState>>,
    Path(model_op): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let Some((model, operation)) = model_op.split_once(':') else {
        return openai_error(
            GatewayError::Translation(format!(
                "path must be models/{{model}}:generateContent, got '{}'",
                model_op
            ))
            .into(),
        );
    };
    if operation != "generateContent" && operation != "streamGenerateContent" {
        return openai_error(
            GatewayError::Translation(format!("unknown operation '{}'", operation)).into(),
        );
    }
    tracing::Span::current().record("model", model);

    let mut request: GenerateContentRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return openai_error(
                GatewayError::Translation(format!("payload deserialization failed: {}", e)).into(),
            )
        }
    };

    if let Some(config) = request.generation_config.as_mut() {
        config.candidate_count = None;
    }
    if let Some(instruction) = state.config.system_instruction().await {
        inject_system_instruction(&mut request, &instruction);
    }

    let session_id = google_session_id(&request);
    logging::log_request_summary("google", model, request.contents.len(), true);

    let served = match state.client.call(model, &request, &session_id).await {
        Ok(s) => s,
        Err(e) => return openai_error(e),
    };

    let streaming_requested = operation == "streamGenerateContent"
        && params.get("alt").map(|v| v == "sse").unwrap_or(false);

    if streaming_requested {
        streaming::stream_google_response(served)
    } else {
        match upstream::collect_stream(served.stream).await {
            Ok(merged) => Json(merged).into_response(),
            Err(e) => openai_error(e),
        }
    }
}

fn inject_system_instruction(request: &mut GenerateContentRequest, instruction: &str) {
    use antigravity_gateway::specs::google::{Content, Part};
    match request.system_instruction.as_mut() {
        Some(existing) => {
            let present = existing
                .parts
                .iter()
                .any(|p| p.text.as_deref().map(|t| t.contains(instruction)).unwrap_or(false));
            if !present {
                existing.parts.insert(0, Part::text(instruction));
            }
        }
        None => {
            request.system_instruction = Some(Content {
                role: "user".to_string(),
                parts: vec![Part::text(instruction)],
            });
        }
    }
}

/// Session affinity for native callers mirrors the lifted dialects: the
/// digest of the first user content's text parts.
fn google_session_id(request: &GenerateContentRequest) -> String {
    let mut hasher = Sha256::new();
    if let Some(first_user) = request.contents.iter().find(|c| c.role == "user") {
        for part in &first_user.parts {
            if let Some(text) = &part.text {
                hasher.update(text.as_bytes());
            }
        }
    }
    format!("{:x}", hasher.finalize())
}

/// --- BOOTSTRAP ---

fn init_tracing(debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let default_filter = if debug {
        "antigravity_gateway=debug"
    } else {
        "antigravity_gateway=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let file_appender = tracing_appender::rolling::daily(".", "antigravity-gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if args.command != "serve" {
        eprintln!("Unknown subcommand: {}", args.command);
        std::process::exit(1);
    }
    let args = Arc::new(args);
    let settings = Settings::from_env();

    let _log_guard = init_tracing(settings.debug);
    logging::setup_panic_hook();

    let http = match reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .read_timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let config_dir = args
        .config_dir
        .clone()
        .unwrap_or_else(antigravity_gateway::accounts::config_dir);
    let pool = Arc::new(AccountPool::load(
        config_dir.join("accounts.json"),
        http.clone(),
    ));
    let config = Arc::new(GatewayConfigStore::load(config_dir.join("gateway.json")));
    let health = Arc::new(UpstreamHealth::default());
    let signatures = Arc::new(SignatureCache::default());

    let state = Arc::new(AppState {
        client: CloudCodeClient::new(http, pool, health.clone()),
        signatures,
        config,
        health,
        fallback_enabled: settings.fallback,
        debug: settings.debug,
        webui_password: settings.webui_password.clone(),
        args: args.clone(),
    });

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/v1beta/models/:model_op", post(google_handler))
        .route("/v1/models", get(antigravity_gateway::health::list_models))
        .route("/health", get(antigravity_gateway::health::liveness))
        .route(
            "/account-limits",
            get(antigravity_gateway::health::account_limits),
        )
        .route(
            "/api/gateway/config",
            get(antigravity_gateway::health::get_gateway_config)
                .post(antigravity_gateway::health::set_gateway_config),
        )
        .layer(axum::extract::DefaultBodyLimit::max(args.max_body_size))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port = settings.port.unwrap_or(args.port);
    let addr = format!("{}:{}", args.host, port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let span = tracing::info_span!("server", %addr);
    async move {
        tracing::info!("antigravity-gateway listening on {}", addr);
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
            std::process::exit(1);
        }
    }
    .instrument(span)
    .await;
}
