//! Relay configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::{Error, Result};
use crate::graph::{ClientCredentials, GraphConfig, RetryConfig};

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_GRAPH_ENDPOINT: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 35 * 1024 * 1024;

/// Everything needed to run one relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Mailbox the relay sends as.
    pub mailbox: String,
    pub bind_address: IpAddr,
    /// 0 picks an ephemeral port.
    pub smtp_port: u16,
    /// Name used in the SMTP greeting and EHLO reply.
    pub server_name: String,
    /// Host named in the body footer. Defaults to the machine hostname.
    pub footer_host: Option<String>,
    pub max_message_size: usize,
    pub authority_host: String,
    pub graph_endpoint: String,
    pub save_to_sent_items: bool,
    pub request_timeout: Duration,
    pub max_delivery_attempts: u32,
    /// How long in-flight sessions may keep running after shutdown starts.
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Config with the required identity values and defaults everywhere else.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        mailbox: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into()),
            mailbox: mailbox.into(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            smtp_port: 25,
            server_name: "localhost".to_string(),
            footer_host: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            graph_endpoint: DEFAULT_GRAPH_ENDPOINT.to_string(),
            save_to_sent_items: true,
            request_timeout: Duration::from_secs(30),
            max_delivery_attempts: 3,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Reject configurations that could only fail once mail arrives.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("tenant id", self.tenant_id.as_str()),
            ("client id", self.client_id.as_str()),
            ("client secret", self.client_secret.expose_secret().as_str()),
            ("mailbox", self.mailbox.as_str()),
            ("server name", self.server_name.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} is required")));
            }
        }

        for (name, url) in [
            ("authority host", &self.authority_host),
            ("graph endpoint", &self.graph_endpoint),
        ] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(Error::Config(format!("{name} must be an http(s) URL: {url}")));
            }
        }

        if self.max_message_size == 0 {
            return Err(Error::Config("max message size must be positive".into()));
        }
        if self.max_delivery_attempts == 0 {
            return Err(Error::Config("max delivery attempts must be at least 1".into()));
        }

        Ok(())
    }

    /// Footer host, falling back to the machine hostname and then the server name.
    #[must_use]
    pub fn footer_host(&self) -> String {
        if let Some(host) = self.footer_host.as_ref().filter(|h| !h.is_empty()) {
            return host.clone();
        }
        match hostname::get().map(|h| h.into_string()) {
            Ok(Ok(name)) if !name.is_empty() => name,
            Ok(_) => {
                warn!("hostname is empty or not valid UTF-8, using server name in footer");
                self.server_name.clone()
            }
            Err(e) => {
                warn!("unable to read hostname, using server name in footer: {e}");
                self.server_name.clone()
            }
        }
    }

    #[must_use]
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            credentials: ClientCredentials {
                tenant_id: self.tenant_id.clone(),
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
            },
            mailbox: self.mailbox.clone(),
            authority_host: self.authority_host.clone(),
            graph_endpoint: self.graph_endpoint.clone(),
            save_to_sent_items: self.save_to_sent_items,
            request_timeout: self.request_timeout,
            retry: RetryConfig {
                max_attempts: self.max_delivery_attempts,
                ..RetryConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayConfig {
        RelayConfig::new("tenant", "app", "secret", "scanner@example.com")
    }

    #[test]
    fn defaults_are_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn missing_identity_values_are_fatal() {
        let cases: [fn(&mut RelayConfig); 4] = [
            |c| c.tenant_id.clear(),
            |c| c.client_id = "  ".into(),
            |c| c.client_secret = SecretString::new(String::new()),
            |c| c.mailbox.clear(),
        ];
        for mutate in cases {
            let mut config = valid();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn rejects_non_http_endpoints() {
        let mut config = valid();
        config.graph_endpoint = "graph.microsoft.com".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn explicit_footer_host_wins() {
        let mut config = valid();
        config.footer_host = Some("scanner-01".into());
        assert_eq!(config.footer_host(), "scanner-01");
    }

    #[test]
    fn secret_is_not_debug_printed() {
        let printed = format!("{:?}", valid());
        assert!(!printed.contains("secret\""));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn graph_config_carries_identity() {
        let graph = valid().graph_config();
        assert_eq!(graph.credentials.tenant_id, "tenant");
        assert_eq!(graph.mailbox, "scanner@example.com");
        assert_eq!(graph.retry.max_attempts, 3);
    }
}
