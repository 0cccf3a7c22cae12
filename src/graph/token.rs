//! Client-credential token acquisition for Microsoft Graph.
//!
//! One [`TokenCache`] is shared by every session. The cached token sits behind
//! an async mutex that is held across the token request, so concurrent callers
//! that find the token stale wait for a single refresh and then reuse it.

use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DeliveryError;

/// Scope requesting every application permission granted to the app.
pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Application identity used for the client-credentials grant.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

struct CachedToken {
    value: SecretString,
    refresh_at: Instant,
}

/// Lazily refreshed bearer token.
pub struct TokenCache {
    http: reqwest::Client,
    token_url: String,
    credentials: ClientCredentials,
    refresh_buffer: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new(http: reqwest::Client, authority_host: &str, credentials: ClientCredentials) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            authority_host.trim_end_matches('/'),
            credentials.tenant_id
        );
        Self {
            http,
            token_url,
            credentials,
            refresh_buffer: Duration::from_secs(300),
            cached: Mutex::new(None),
        }
    }

    /// Refresh this long before the reported expiry.
    #[must_use]
    pub const fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Current token, fetching a new one when none is cached or it is about to expire.
    pub async fn access_token(&self) -> Result<SecretString, DeliveryError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token if it is still `stale`, forcing the next call to refresh.
    pub async fn invalidate(&self, stale: &SecretString) {
        let mut cached = self.cached.lock().await;
        if cached
            .as_ref()
            .is_some_and(|t| t.value.expose_secret() == stale.expose_secret())
        {
            debug!("discarding rejected access token");
            *cached = None;
        }
    }

    async fn fetch(&self) -> Result<CachedToken, DeliveryError> {
        let body = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.expose_secret().as_str()),
            ("scope", GRAPH_SCOPE),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

        let started = Instant::now();
        let response = self
            .http
            .post(&self.token_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(reqwest::header::ACCEPT, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TokenErrorResponse>(&text).map_or_else(
                |_| text.clone(),
                |e| match e.error_description {
                    Some(desc) => format!("{}: {}", e.error, desc),
                    None => e.error,
                },
            );
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                DeliveryError::Transient(format!("token endpoint returned {status}: {detail}"))
            } else {
                DeliveryError::Auth(format!("token endpoint returned {status}: {detail}"))
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("invalid token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));
        info!(
            tenant = %self.credentials.tenant_id,
            expires_in = lifetime.as_secs(),
            "acquired Graph access token"
        );

        Ok(CachedToken {
            value: SecretString::new(token.access_token),
            refresh_at: started + lifetime.saturating_sub(self.refresh_buffer),
        })
    }
}
