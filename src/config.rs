//! Operator-configured gateway state: the system instruction prepended to
//! every upstream request, persisted as `gateway.json` next to the account
//! pool.

use crate::constants::SYSTEM_INSTRUCTION_SENTINEL;
use crate::types::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

pub struct GatewayConfigStore {
    path: PathBuf,
    state: RwLock<GatewayConfig>,
}

impl GatewayConfigStore {
    pub fn load(path: PathBuf) -> Self {
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<GatewayConfig>(&raw) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        "[config] {} unreadable ({}); using defaults",
                        path.display(),
                        e
                    );
                    GatewayConfig::default()
                }
            },
            Err(_) => GatewayConfig::default(),
        };
        Self {
            path,
            state: RwLock::new(config),
        }
    }

    pub async fn get(&self) -> GatewayConfig {
        self.state.read().await.clone()
    }

    pub async fn system_instruction(&self) -> Option<String> {
        self.state.read().await.system_instruction.clone()
    }

    /// Replace the system instruction. Rejected unless the text carries the
    /// identity sentinel, which keeps a stray write from silently detaching
    /// the gateway from its upstream persona.
    pub async fn set_system_instruction(&self, text: String) -> Result<()> {
        if !text.contains(SYSTEM_INSTRUCTION_SENTINEL) {
            return Err(GatewayError::Translation(format!(
                "systemInstruction must contain \"{}\"",
                SYSTEM_INSTRUCTION_SENTINEL
            ))
            .into());
        }

        let config = {
            let mut state = self.state.write().await;
            state.system_instruction = Some(text);
            state.clone()
        };
        self.persist(&config).await
    }

    async fn persist(&self, config: &GatewayConfig) -> Result<()> {
        let payload = serde_json::to_vec_pretty(config).map_err(GatewayError::from)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
                let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                std::io::Write::write_all(&mut tmp, &payload)?;
                tmp.persist(&path).map_err(|e| e.error)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("persist task failed: {}", e)))?
        .map_err(GatewayError::from)?;
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    crate::accounts::config_dir().join("gateway.json")
}
