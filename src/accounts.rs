//! Multi-credential account pool.
//!
//! Selection is sticky by session id because upstream prompt caching is
//! keyed per account; fairness only matters once an account is cooling
//! down. All state mutations happen under one async mutex and are written
//! through atomically to `accounts.json`.

use crate::constants::*;
use crate::types::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_429_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_429s: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_expiry: Option<DateTime<Utc>>,
    pub project_id: String,
    #[serde(default)]
    pub limits: HashMap<String, ModelLimit>,
    #[serde(default)]
    pub last_session_id: Option<String>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
}

impl Account {
    fn cooled_down(&self, model: &str, now: DateTime<Utc>) -> bool {
        self.limits
            .get(model)
            .and_then(|l| l.cooldown_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolFile {
    #[serde(default)]
    accounts: Vec<Account>,
}

struct PoolState {
    accounts: Vec<Account>,
    cursor: usize,
    refresh_flights: HashMap<String, Arc<Mutex<()>>>,
}

pub struct AccountPool {
    state: Mutex<PoolState>,
    path: PathBuf,
    base_cooldown: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl AccountPool {
    /// Load the pool from disk. A missing or truncated file initializes an
    /// empty pool rather than failing startup.
    pub fn load(path: PathBuf, http: reqwest::Client) -> Self {
        let accounts = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PoolFile>(&raw) {
                Ok(file) => file.accounts,
                Err(e) => {
                    tracing::warn!("[pool] {} unreadable ({}); starting empty", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        tracing::info!("[pool] loaded {} account(s)", accounts.len());
        Self {
            state: Mutex::new(PoolState {
                accounts,
                cursor: 0,
                refresh_flights: HashMap::new(),
            }),
            path,
            base_cooldown: Duration::from_secs(BASE_COOLDOWN_SECS),
            http,
        }
    }

    #[cfg(test)]
    pub fn with_accounts(path: PathBuf, accounts: Vec<Account>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                accounts,
                cursor: 0,
                refresh_flights: HashMap::new(),
            }),
            path,
            base_cooldown: Duration::from_secs(BASE_COOLDOWN_SECS),
            http: reqwest::Client::new(),
        }
    }

    /// Pick an account for `model`, preferring the one that served this
    /// session before. Accounts in `excluding` (already tried for this
    /// request) are passed over so a silent-stream retry lands elsewhere.
    /// Returns the account email.
    pub async fn pick_next(
        &self,
        model: &str,
        session_id: &str,
        excluding: &[String],
    ) -> Option<String> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let sticky_idx = state.accounts.iter().position(|a| {
            !a.disabled
                && a.last_session_id.as_deref() == Some(session_id)
                && !excluding.contains(&a.email)
        });

        if let Some(idx) = sticky_idx {
            if !state.accounts[idx].cooled_down(model, now) {
                return Some(Self::touch(&mut state.accounts[idx], session_id, now));
            }
        }

        // Round-robin over the remaining accounts, skipping cooldowns.
        let len = state.accounts.len();
        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            let account = &state.accounts[idx];
            if account.disabled
                || excluding.contains(&account.email)
                || account.cooled_down(model, now)
            {
                continue;
            }
            state.cursor = (idx + 1) % len;
            return Some(Self::touch(&mut state.accounts[idx], session_id, now));
        }

        // Everything is cooling down. If the oldest cooldown is young the
        // limit was likely a blip shared across accounts; ride it out on
        // the sticky account instead of failing the request.
        let oldest_429 = state
            .accounts
            .iter()
            .filter(|a| !a.disabled)
            .filter_map(|a| a.limits.get(model).and_then(|l| l.last_429_at))
            .min()?;
        if (now - oldest_429).num_seconds() < COOLDOWN_TOLERANCE_SECS {
            let idx = sticky_idx.or_else(|| state.accounts.iter().position(|a| !a.disabled))?;
            tracing::warn!(
                "[pool] all accounts cooling down for {}; reusing {} within tolerance",
                model,
                state.accounts[idx].email
            );
            return Some(Self::touch(&mut state.accounts[idx], session_id, now));
        }

        None
    }

    /// Read-only probe: would `pick_next` find anything for this model?
    /// Used by the dispatcher to decide on model fallback without touching
    /// sticky state.
    pub async fn has_available(&self, model: &str) -> bool {
        let now = Utc::now();
        let state = self.state.lock().await;
        if state
            .accounts
            .iter()
            .any(|a| !a.disabled && !a.cooled_down(model, now))
        {
            return true;
        }
        state
            .accounts
            .iter()
            .filter(|a| !a.disabled)
            .filter_map(|a| a.limits.get(model).and_then(|l| l.last_429_at))
            .min()
            .map(|oldest| (now - oldest).num_seconds() < COOLDOWN_TOLERANCE_SECS)
            .unwrap_or(false)
    }

    fn touch(account: &mut Account, session_id: &str, now: DateTime<Utc>) -> String {
        account.last_session_id = Some(session_id.to_string());
        account.last_used = Some(now);
        account.email.clone()
    }

    /// Apply a 429 to this account/model: exponential cooldown, upstream
    /// reset time winning when longer.
    pub async fn record_rate_limit(
        &self,
        email: &str,
        model: &str,
        retry_after: Option<Duration>,
    ) {
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) else {
                return;
            };
            let limit = account.limits.entry(model.to_string()).or_default();
            limit.consecutive_429s = limit.consecutive_429s.saturating_add(1);
            limit.last_429_at = Some(now);

            let multiplier = 2u32
                .saturating_pow(limit.consecutive_429s.saturating_sub(1))
                .min(MAX_COOLDOWN_MULTIPLIER);
            let backoff = self.base_cooldown * multiplier;
            let cooldown = retry_after.map_or(backoff, |upstream| upstream.max(backoff));
            let cooldown_chrono = chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(BASE_COOLDOWN_SECS as i64));
            limit.cooldown_until = Some(now + cooldown_chrono);

            tracing::warn!(
                "[pool] {} cooling down for {}s on {} (x{} consecutive)",
                email,
                cooldown.as_secs(),
                model,
                limit.consecutive_429s
            );
        }
        self.persist().await;
    }

    /// A successful call clears the backoff streak for this model.
    pub async fn record_success(&self, email: &str, model: &str) {
        let mut dirty = false;
        {
            let mut state = self.state.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
                if let Some(limit) = account.limits.get_mut(model) {
                    if limit.consecutive_429s != 0 {
                        limit.consecutive_429s = 0;
                        dirty = true;
                    }
                }
            }
        }
        if dirty {
            self.persist().await;
        }
    }

    /// Refresh failures leave the account out of rotation until an operator
    /// re-imports its credentials.
    pub async fn mark_disabled(&self, email: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
                account.disabled = true;
                tracing::error!("[pool] {} disabled pending operator intervention", email);
            }
        }
        self.persist().await;
    }

    /// Current access token for the account, refreshing through the OAuth
    /// endpoint when it expires within the skew window. Concurrent callers
    /// for the same account share one refresh.
    pub async fn get_token(&self, email: &str) -> Result<(String, String)> {
        if let Some(token) = self.fresh_token(email).await? {
            return Ok(token);
        }

        let flight = {
            let mut state = self.state.lock().await;
            state
                .refresh_flights
                .entry(email.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // Another caller may have refreshed while we waited on the flight.
        if let Some(token) = self.fresh_token(email).await? {
            return Ok(token);
        }

        let refresh_token = {
            let state = self.state.lock().await;
            let account = state
                .accounts
                .iter()
                .find(|a| a.email == email)
                .ok_or_else(|| GatewayError::Auth(format!("unknown account {}", email)))?;
            if account.refresh_token.is_empty() {
                return Err(GatewayError::Auth(format!(
                    "account {} has no refresh token",
                    email
                ))
                .into());
            }
            account.refresh_token.clone()
        };

        tracing::info!("[pool] refreshing access token for {}", email);
        let response = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Auth(format!("token refresh failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            self.mark_disabled(email).await;
            return Err(GatewayError::Auth(format!(
                "token refresh rejected ({}): {}",
                status, body
            ))
            .into());
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Auth(format!("token response unreadable: {}", e)))?;

        let project_id = {
            let mut state = self.state.lock().await;
            let account = state
                .accounts
                .iter_mut()
                .find(|a| a.email == email)
                .ok_or_else(|| GatewayError::Auth(format!("unknown account {}", email)))?;
            account.access_token = Some(token.access_token.clone());
            account.access_token_expiry =
                Some(Utc::now() + chrono::Duration::seconds(token.expires_in));
            account.project_id.clone()
        };
        self.persist().await;

        Ok((token.access_token, project_id))
    }

    async fn fresh_token(&self, email: &str) -> Result<Option<(String, String)>> {
        let state = self.state.lock().await;
        let account = state
            .accounts
            .iter()
            .find(|a| a.email == email)
            .ok_or_else(|| GatewayError::Auth(format!("unknown account {}", email)))?;
        if account.disabled {
            return Err(GatewayError::Auth(format!("account {} is disabled", email)).into());
        }
        let fresh = match (&account.access_token, &account.access_token_expiry) {
            (Some(token), Some(expiry))
                if *expiry > Utc::now() + chrono::Duration::seconds(TOKEN_REFRESH_SKEW_SECS) =>
            {
                Some((token.clone(), account.project_id.clone()))
            }
            _ => None,
        };
        Ok(fresh)
    }

    /// Per-account, per-model cooldown state for the operator endpoint.
    pub async fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let accounts: Vec<serde_json::Value> = state
            .accounts
            .iter()
            .map(|a| {
                serde_json::json!({
                    "email": a.email,
                    "disabled": a.disabled,
                    "lastUsed": a.last_used,
                    "limits": a.limits,
                })
            })
            .collect();
        serde_json::json!({ "accounts": accounts })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    /// Write the pool through a temp file and rename so a crash never
    /// leaves a torn accounts.json behind.
    async fn persist(&self) {
        let payload = {
            let state = self.state.lock().await;
            match serde_json::to_vec_pretty(&PoolFile {
                accounts: state.accounts.clone(),
            }) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("[pool] serialize failed: {}", e);
                    return;
                }
            }
        };

        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
                let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                std::io::Write::write_all(&mut tmp, &payload)?;
                tmp.persist(&path).map_err(|e| e.error)?;
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("[pool] persist failed: {}", e),
            Err(e) => tracing::error!("[pool] persist task failed: {}", e),
        }
    }
}

/// Per-user directory holding accounts.json and gateway.json.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("antigravity-gateway")
}
