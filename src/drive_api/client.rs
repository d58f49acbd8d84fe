use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use crate::auth::TokenManager;

use super::types::DriveApiError;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

pub struct DriveClient {
    http: reqwest::Client,
    token_manager: Arc<TokenManager>,
}

impl DriveClient {
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    /// Build an authenticated request to the metadata API.
    pub fn api_request(&self, method: Method, path: &str) -> AuthenticatedRequest<'_> {
        let url = format!("{API_BASE}{path}");
        AuthenticatedRequest {
            client: self,
            builder: self.http.request(method.clone(), &url),
            method,
        }
    }

    /// Build an authenticated request to the media upload endpoint.
    pub fn upload_request(&self, method: Method, path: &str) -> AuthenticatedRequest<'_> {
        let url = format!("{UPLOAD_BASE}{path}");
        AuthenticatedRequest {
            client: self,
            builder: self.http.request(method.clone(), &url),
            method,
        }
    }
}

/// Helper that attaches the bearer token and sends with retry logic.
pub struct AuthenticatedRequest<'a> {
    client: &'a DriveClient,
    builder: RequestBuilder,
    method: Method,
}

impl AuthenticatedRequest<'_> {
    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.builder = self.builder.query(params);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.builder = self.builder.header(key, value);
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.builder = self.builder.json(body);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.builder = self.builder.body(body);
        self
    }

    /// Send the request with automatic auth, retrying on rate limits (429)
    /// and, for idempotent methods, transient server errors (5xx).
    pub async fn send(self) -> Result<Response> {
        const MAX_RETRIES: u32 = 5;
        let mut builder = self.builder;

        for attempt in 0..=MAX_RETRIES {
            let token = self.client.token_manager.get_access_token().await?;
            // Clone before consuming; fine for in-memory bodies.
            let retry_builder = builder.try_clone();

            let resp = builder
                .bearer_auth(&token)
                .send()
                .await
                .context("HTTP request failed")?;

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            if is_retryable(&self.method, status) {
                if attempt == MAX_RETRIES {
                    anyhow::bail!("Drive API still failing ({status}) after {MAX_RETRIES} retries");
                }
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1 << attempt);
                let wait = Duration::from_secs(retry_after) + jitter();
                tracing::warn!(
                    %status,
                    retry_after,
                    attempt = attempt + 1,
                    "transient Drive API failure, waiting {wait:?}"
                );
                tokio::time::sleep(wait).await;

                match retry_builder {
                    Some(b) => {
                        builder = b;
                        continue;
                    }
                    None => anyhow::bail!("Cannot retry request with streamed body ({status})"),
                }
            }

            let body = resp.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<DriveApiError>(&body) {
                anyhow::bail!("{err}");
            }
            anyhow::bail!("Drive API error ({status}): {body}");
        }

        anyhow::bail!("Drive API request gave up after {MAX_RETRIES} retries")
    }
}

/// A 5xx answer to a POST may follow a completed create; only 429 is retried there.
fn is_retryable(method: &Method, status: StatusCode) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status.is_server_error() && *method != Method::POST
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 1000;
    Duration::from_millis(ms)
}
