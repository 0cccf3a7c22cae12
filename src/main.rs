//! CLI entry point for smtp-graph-relay.

use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use smtp_graph_relay::{
    start_relay, RelayConfig, DEFAULT_AUTHORITY_HOST, DEFAULT_GRAPH_ENDPOINT,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "smtp-graph-relay")]
#[command(about = "Receive mail over SMTP and send it through Microsoft Graph")]
struct Cli {
    /// Entra ID tenant of the sending application
    #[arg(long, env = "RELAY_TENANT_ID")]
    tenant_id: String,

    /// Application (client) id
    #[arg(long, env = "RELAY_CLIENT_ID")]
    client_id: String,

    /// Application client secret
    #[arg(long, env = "RELAY_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// Mailbox to send as
    #[arg(long, env = "RELAY_MAILBOX")]
    mailbox: String,

    /// Address to bind the SMTP listener to
    #[arg(long, env = "RELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// SMTP port to listen on
    #[arg(short = 's', long, env = "RELAY_SMTP_PORT", default_value = "25")]
    smtp_port: u16,

    /// Name announced in the SMTP greeting
    #[arg(long, env = "RELAY_SERVER_NAME", default_value = "localhost")]
    server_name: String,

    /// Host named in the body footer (defaults to the machine hostname)
    #[arg(long, env = "RELAY_FOOTER_HOST")]
    footer_host: Option<String>,

    /// Largest accepted message in bytes
    #[arg(long, env = "RELAY_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    #[arg(long, env = "RELAY_AUTHORITY_HOST", default_value = DEFAULT_AUTHORITY_HOST)]
    authority_host: String,

    #[arg(long, env = "RELAY_GRAPH_ENDPOINT", default_value = DEFAULT_GRAPH_ENDPOINT)]
    graph_endpoint: String,

    /// Do not keep a copy in the mailbox's Sent Items
    #[arg(long, env = "RELAY_NO_SAVE_TO_SENT")]
    no_save_to_sent: bool,

    /// Graph request timeout in seconds
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT", default_value = "30")]
    request_timeout: u64,

    /// Delivery attempts per message, including the first
    #[arg(long, env = "RELAY_MAX_DELIVERY_ATTEMPTS", default_value = "3")]
    max_delivery_attempts: u32,

    /// Seconds open sessions may run after shutdown begins
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE", default_value = "10")]
    shutdown_grace: u64,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            client_secret: SecretString::new(self.client_secret),
            mailbox: self.mailbox,
            bind_address: self.bind_address,
            smtp_port: self.smtp_port,
            server_name: self.server_name,
            footer_host: self.footer_host,
            max_message_size: self.max_message_size,
            authority_host: self.authority_host,
            graph_endpoint: self.graph_endpoint,
            save_to_sent_items: !self.no_save_to_sent,
            request_timeout: Duration::from_secs(self.request_timeout),
            max_delivery_attempts: self.max_delivery_attempts,
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config();

    let relay = match start_relay(config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = shutdown_signal().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown requested");
    relay.stop().await;

    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
