//! Seam between the relay core and the remote mail API.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::outbound::OutboundMessage;

/// Sends one outbound message. Implementations own their credentials and
/// retries and must be safe to share between sessions.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Send `message`, giving up with [`DeliveryError::Cancelled`] once `cancel` fires.
    async fn send(
        &self,
        message: &OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;
}
