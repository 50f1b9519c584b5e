use crate::config::GatewayConfigStore;
use crate::signatures::SignatureCache;
use crate::types::UpstreamHealth;
use crate::upstream::CloudCodeClient;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand; only `serve` exists.
    #[arg(default_value = "serve")]
    pub command: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Override the per-user config directory holding accounts.json and
    /// gateway.json.
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}

/// Environment switches layered over the CLI arguments.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub port: Option<u16>,
    pub debug: bool,
    pub fallback: bool,
    pub webui_password: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT").ok().and_then(|p| p.parse().ok()),
            debug: env_flag("DEBUG"),
            fallback: env_flag("FALLBACK"),
            webui_password: std::env::var("WEBUI_PASSWORD").ok().filter(|p| !p.is_empty()),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub struct AppState {
    pub client: CloudCodeClient,
    pub signatures: Arc<SignatureCache>,
    pub config: Arc<GatewayConfigStore>,
    pub health: Arc<UpstreamHealth>,
    pub fallback_enabled: bool,
    pub debug: bool,
    pub webui_password: Option<String>,
    pub args: Arc<Args>,
}
