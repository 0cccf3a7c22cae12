//! Microsoft Graph `sendMail` delivery client.

mod token;

pub use token::{ClientCredentials, TokenCache, GRAPH_SCOPE};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, Error};
use crate::outbound::{OutboundMessage, SendMailRequest};

/// Backoff applied to transient failures inside a single send.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Settings for [`GraphClient`].
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub credentials: ClientCredentials,
    /// User id or principal name of the sending mailbox.
    pub mailbox: String,
    pub authority_host: String,
    pub graph_endpoint: String,
    pub save_to_sent_items: bool,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Deserialize)]
struct GraphErrorDetail {
    code: String,
    message: String,
}

struct Failure {
    error: DeliveryError,
    retry_after: Option<Duration>,
}

impl From<DeliveryError> for Failure {
    fn from(error: DeliveryError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Sends mail as the configured mailbox using application permissions.
pub struct GraphClient {
    http: reqwest::Client,
    tokens: TokenCache,
    send_url: String,
    save_to_sent_items: bool,
    retry: RetryConfig,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        let tokens = TokenCache::new(http.clone(), &config.authority_host, config.credentials);
        let send_url = format!(
            "{}/users/{}/sendMail",
            config.graph_endpoint.trim_end_matches('/'),
            urlencoding::encode(&config.mailbox)
        );

        Ok(Self {
            http,
            tokens,
            send_url,
            save_to_sent_items: config.save_to_sent_items,
            retry: config.retry,
        })
    }

    /// One logical attempt. A 401 discards the token and tries once more with a fresh one.
    async fn attempt(&self, body: &Bytes) -> Result<(), Failure> {
        let mut refreshed = false;
        loop {
            let token = self.tokens.access_token().await?;
            let response = self
                .http
                .post(&self.send_url)
                .header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()))
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await
                .map_err(DeliveryError::from)?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!("Graph rejected access token, refreshing");
                self.tokens.invalidate(&token).await;
                refreshed = true;
                continue;
            }

            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(Failure {
                error: classify(status, &text),
                retry_after,
            });
        }
    }
}

#[async_trait]
impl DeliveryClient for GraphClient {
    async fn send(
        &self,
        message: &OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let request = SendMailRequest {
            message,
            save_to_sent_items: self.save_to_sent_items,
        };
        let body = serde_json::to_vec(&request)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::Rejected {
                status: 0,
                message: format!("cannot serialize message: {e}"),
            })?;

        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                r = self.attempt(&body) => r,
                () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            };

            let failure = match result {
                Ok(()) => return Ok(()),
                Err(f) => f,
            };

            let retryable = matches!(failure.error, DeliveryError::Transient(_));
            if !retryable || attempt >= self.retry.max_attempts {
                return Err(failure.error);
            }

            let delay = failure
                .retry_after
                .unwrap_or_else(|| self.retry.delay(attempt))
                .min(self.retry.max_delay);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Graph send failed, retrying: {}",
                failure.error
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            }
            attempt += 1;
        }
    }
}

fn classify(status: StatusCode, body: &str) -> DeliveryError {
    let detail = serde_json::from_str::<GraphErrorBody>(body).map_or_else(
        |_| body.trim().to_string(),
        |b| format!("{}: {}", b.error.code, b.error.message),
    );

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::Auth(format!("{status}: {detail}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DeliveryError::Transient(format!("{status}: {detail}"))
        }
        s if s.is_server_error() => DeliveryError::Transient(format!("{status}: {detail}")),
        s => DeliveryError::Rejected {
            status: s.as_u16(),
            message: detail,
        },
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
