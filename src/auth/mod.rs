mod token_store;

use token_store::TokenData;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::config::Config;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

pub struct TokenManager {
    client_id: String,
    client_secret: String,
    token_path: PathBuf,
    tokens: Mutex<Option<TokenData>>,
    http_client: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Google only returns a new refresh token when it rotates one.
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

impl TokenManager {
    pub fn new(config: &Config) -> Result<Self> {
        let token_path = token_store::resolve_token_path(config.auth.token_path.as_deref())?;
        let tokens = if token_path.exists() {
            match token_store::load_tokens(&token_path) {
                Ok(t) => {
                    tracing::info!("loaded existing tokens");
                    Some(t)
                }
                Err(e) => {
                    tracing::warn!("failed to load tokens: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        if tokens.is_none() {
            tracing::warn!(path = %token_path.display(), "no usable tokens, provision tokens.json first");
        }

        Ok(Self {
            client_id: config.auth.client_id.clone(),
            client_secret: config.auth.client_secret.clone(),
            token_path,
            tokens: Mutex::new(tokens),
            http_client: reqwest::Client::new(),
        })
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut guard = self.tokens.lock().await;
        let tokens = guard.as_mut().with_context(|| {
            format!(
                "Not authenticated. Provision {} with a Google OAuth refresh token.",
                self.token_path.display()
            )
        })?;

        // Refresh if token expires within 60 seconds
        let now = chrono::Utc::now();
        let buffer = chrono::Duration::seconds(60);
        if tokens.expires_at <= now + buffer {
            tracing::debug!("access token expired or expiring soon, refreshing");
            let resp = self.refresh(tokens).await?;
            *tokens = apply_refresh(tokens, resp, now);
            token_store::save_tokens(&self.token_path, tokens)?;
            tracing::debug!("token refreshed successfully");
        }

        Ok(tokens.access_token.clone())
    }

    async fn refresh(&self, tokens: &TokenData) -> Result<TokenResponse> {
        let resp = self
            .http_client
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("Failed to contact Google token endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Token refresh failed ({status}): {body}\n\
                 The refresh token may have been revoked; provision a new {}",
                self.token_path.display()
            );
        }

        resp.json().await.context("Failed to parse token response")
    }
}

fn apply_refresh(
    old: &TokenData,
    resp: TokenResponse,
    now: chrono::DateTime<chrono::Utc>,
) -> TokenData {
    TokenData {
        access_token: resp.access_token,
        refresh_token: resp
            .refresh_token
            .unwrap_or_else(|| old.refresh_token.clone()),
        expires_at: now + chrono::Duration::seconds(resp.expires_in as i64),
    }
}
