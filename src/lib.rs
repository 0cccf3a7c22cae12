//! SMTP relay that forwards received mail through the Microsoft Graph API.
//!
//! [`start_relay`] binds the SMTP listener and wires the session, decoder,
//! transformer and Graph client together. [`start_relay_with`] accepts any
//! [`DeliveryClient`], which is how the tests substitute the upstream.

mod config;
mod decode;
mod delivery;
mod email;
mod error;
mod graph;
mod intake;
mod outbound;
mod reply;
mod smtp;
mod transform;

pub use config::{RelayConfig, DEFAULT_AUTHORITY_HOST, DEFAULT_GRAPH_ENDPOINT, DEFAULT_MAX_MESSAGE_SIZE};
pub use decode::{decode, decode_transaction};
pub use delivery::DeliveryClient;
pub use email::{Attachment, Envelope, MailDocument, Mailbox, RawTransaction};
pub use error::{DecodeError, DeliveryError, Error, Result};
pub use graph::{ClientCredentials, GraphClient, GraphConfig, RetryConfig, TokenCache, GRAPH_SCOPE};
pub use intake::{MessageIntake, RelayIntake};
pub use outbound::{BodyType, EmailAddress, FileAttachment, ItemBody, OutboundMessage, Recipient, SendMailRequest};
pub use reply::Reply;
pub use smtp::{run_session, run_smtp_server, SmtpConfig};
pub use transform::{body_type, Transformer};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to a running relay.
pub struct RunningRelay {
    pub smtp_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    grace: Duration,
}

impl RunningRelay {
    /// Stop accepting connections and let open sessions finish.
    ///
    /// Sessions still running after the grace period are told 421 and any
    /// delivery they have in flight is cancelled.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if tokio::time::timeout(self.grace, &mut self.handle).await.is_ok() {
            info!("relay stopped");
            return;
        }
        warn!(grace = ?self.grace, "sessions still open after grace period, aborting");
        self.abort.cancel();
        let _ = self.handle.await;
        info!("relay stopped");
    }
}

/// Start a relay that delivers through Microsoft Graph.
pub async fn start_relay(config: RelayConfig) -> Result<RunningRelay> {
    config.validate()?;
    let delivery = Arc::new(GraphClient::new(config.graph_config())?);
    start_relay_with(&config, delivery).await
}

/// Start a relay with a caller-supplied delivery client.
pub async fn start_relay_with(
    config: &RelayConfig,
    delivery: Arc<dyn DeliveryClient>,
) -> Result<RunningRelay> {
    config.validate()?;

    let transformer = Transformer::new(config.footer_host());
    let intake: Arc<dyn MessageIntake> = Arc::new(RelayIntake::new(transformer, delivery));

    let listener = TcpListener::bind((config.bind_address, config.smtp_port)).await?;
    let smtp_addr = listener.local_addr()?;
    info!(
        addr = %smtp_addr,
        mailbox = %config.mailbox,
        "SMTP relay listening"
    );

    let smtp_config = SmtpConfig {
        server_name: config.server_name.clone(),
        max_message_size: config.max_message_size,
    };
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        let abort = abort.clone();
        async move {
            run_smtp_server(listener, intake, smtp_config, shutdown, abort).await;
        }
    });

    Ok(RunningRelay {
        smtp_addr,
        handle,
        shutdown,
        abort,
        grace: config.shutdown_grace,
    })
}
