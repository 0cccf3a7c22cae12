//! Per-transaction orchestration: decode, transform, deliver, reply.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::decode::decode_transaction;
use crate::delivery::DeliveryClient;
use crate::email::RawTransaction;
use crate::error::DeliveryError;
use crate::reply::Reply;
use crate::transform::Transformer;

/// Capability the SMTP session calls once per completed DATA transaction.
#[async_trait]
pub trait MessageIntake: Send + Sync {
    async fn intake(&self, transaction: RawTransaction, cancel: &CancellationToken) -> Reply;
}

/// Intake that forwards every message through a [`DeliveryClient`].
pub struct RelayIntake {
    transformer: Transformer,
    delivery: Arc<dyn DeliveryClient>,
}

impl RelayIntake {
    #[must_use]
    pub fn new(transformer: Transformer, delivery: Arc<dyn DeliveryClient>) -> Self {
        Self {
            transformer,
            delivery,
        }
    }
}

#[async_trait]
impl MessageIntake for RelayIntake {
    async fn intake(&self, transaction: RawTransaction, cancel: &CancellationToken) -> Reply {
        let id = Uuid::new_v4().simple();
        let (envelope, data) = transaction.into_contiguous();
        debug!(%id, size = data.len(), "received DATA payload");

        let doc = match decode_transaction(&envelope, &data) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%id, mail_from = ?envelope.mail_from, "rejecting undecodable message: {e}");
                return Reply::from(&e);
            }
        };
        drop(data);

        if cancel.is_cancelled() {
            return Reply::SHUTTING_DOWN;
        }

        let from = doc
            .from
            .as_ref()
            .map_or_else(|| "<none>".to_string(), |m| m.address.clone());
        let recipients: Vec<&str> = doc.recipients().map(|m| m.address.as_str()).collect();
        let attachments: Vec<&str> = doc.attachments.iter().map(|a| a.name.as_str()).collect();
        info!(
            %id,
            %from,
            recipients = %recipients.join(", "),
            attachments = %attachments.join(", "),
            "relaying message"
        );

        let message = self.transformer.transform(doc);

        if cancel.is_cancelled() {
            return Reply::SHUTTING_DOWN;
        }

        match self.delivery.send(&message, cancel).await {
            Ok(()) => {
                info!(%id, "message delivered");
                Reply::relayed(id)
            }
            Err(e @ DeliveryError::Auth(_)) => {
                error!(%id, "delivery not authorized, check tenant and application credentials: {e}");
                Reply::from(&e)
            }
            Err(e) if e.is_transient() => {
                warn!(%id, "delivery failed temporarily: {e}");
                Reply::from(&e)
            }
            Err(e) => {
                warn!(%id, "delivery rejected: {e}");
                Reply::from(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::Envelope;
    use crate::outbound::OutboundMessage;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeDelivery {
        sent: Mutex<Vec<OutboundMessage>>,
        fail_with: Option<DeliveryError>,
        delay: Option<Duration>,
    }

    impl FakeDelivery {
        fn failing(e: DeliveryError) -> Self {
            Self {
                fail_with: Some(e),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliveryClient for FakeDelivery {
        async fn send(
            &self,
            message: &OutboundMessage,
            cancel: &CancellationToken,
        ) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(message.clone());
            if let Some(delay) = self.delay {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                }
            }
            self.fail_with.clone().map_or(Ok(()), Err)
        }
    }

    fn intake_with(delivery: Arc<FakeDelivery>) -> RelayIntake {
        RelayIntake::new(Transformer::new("test-host"), delivery)
    }

    fn transaction(raw: &'static [u8]) -> RawTransaction {
        let chunks = raw.chunks(7).map(Bytes::from_static).collect();
        RawTransaction::new(
            Envelope {
                mail_from: Some("env@x.com".into()),
                rcpt_to: vec!["a@x.com".into()],
            },
            chunks,
        )
    }

    const HI: &[u8] = b"From: s@x.com\r\nTo: a@x.com\r\nSubject: Hi\r\n\r\nhello\r\n";

    #[tokio::test]
    async fn relays_chunked_message() {
        let delivery = Arc::new(FakeDelivery::default());
        let intake = intake_with(Arc::clone(&delivery));

        let reply = intake.intake(transaction(HI), &CancellationToken::new()).await;

        assert_eq!(reply.code, 250);
        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Scan from proxy: Hi");
        assert!(sent[0].body.content.starts_with("hello"));
        assert_eq!(sent[0].to_recipients[0].email_address.address, "a@x.com");
    }

    #[tokio::test]
    async fn malformed_input_never_reaches_delivery() {
        let delivery = Arc::new(FakeDelivery::default());
        let intake = intake_with(Arc::clone(&delivery));

        let truncated = transaction(
            b"To: a@x.com\r\nContent-Type: multipart/mixed; boundary=zz\r\n\r\n--zz\r\n\r\npart\r\n",
        );
        let reply = intake.intake(truncated, &CancellationToken::new()).await;
        assert!(reply.is_permanent());

        let headers_only = transaction(b"To: a@x.com\r\nSubject: no end");
        let reply = intake.intake(headers_only, &CancellationToken::new()).await;
        assert!(reply.is_permanent());

        assert_eq!(delivery.calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_temporary_reply() {
        let delivery = Arc::new(FakeDelivery::failing(DeliveryError::Transient(
            "connection reset".into(),
        )));
        let reply = intake_with(Arc::clone(&delivery))
            .intake(transaction(HI), &CancellationToken::new())
            .await;
        assert!(reply.is_transient());
        assert_eq!(delivery.calls(), 1);
    }

    #[tokio::test]
    async fn auth_and_rejection_are_permanent() {
        for e in [
            DeliveryError::Auth("invalid_client".into()),
            DeliveryError::Rejected {
                status: 400,
                message: "ErrorInvalidRecipients".into(),
            },
        ] {
            let delivery = Arc::new(FakeDelivery::failing(e));
            let reply = intake_with(Arc::clone(&delivery))
                .intake(transaction(HI), &CancellationToken::new())
                .await;
            assert!(reply.is_permanent());
            assert_eq!(delivery.calls(), 1);
        }
    }

    #[tokio::test]
    async fn cancelled_before_send_skips_delivery() {
        let delivery = Arc::new(FakeDelivery::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let reply = intake_with(Arc::clone(&delivery)).intake(transaction(HI), &cancel).await;

        assert_eq!(reply.code, 421);
        assert_eq!(delivery.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_reaches_in_flight_send() {
        let delivery = Arc::new(FakeDelivery {
            delay: Some(Duration::from_secs(30)),
            ..FakeDelivery::default()
        });
        let intake = intake_with(Arc::clone(&delivery));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let reply = tokio::time::timeout(Duration::from_secs(5), intake.intake(transaction(HI), &cancel))
            .await
            .unwrap();
        assert_eq!(reply.code, 421);
    }

    #[tokio::test]
    async fn concurrent_transactions_stay_independent() {
        let delivery = Arc::new(FakeDelivery {
            delay: Some(Duration::from_millis(20)),
            ..FakeDelivery::default()
        });
        let intake = Arc::new(intake_with(Arc::clone(&delivery)));

        let first = {
            let intake = Arc::clone(&intake);
            tokio::spawn(async move {
                intake
                    .intake(
                        transaction(b"To: a@x.com\r\nSubject: first\r\n\r\none\r\n"),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        let second = {
            let intake = Arc::clone(&intake);
            tokio::spawn(async move {
                intake
                    .intake(
                        transaction(b"To: b@x.com\r\nSubject: second\r\n\r\ntwo\r\n"),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };

        assert_eq!(first.await.unwrap().code, 250);
        assert_eq!(second.await.unwrap().code, 250);

        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for msg in sent.iter() {
            match msg.subject.as_str() {
                "Scan from proxy: first" => assert!(msg.body.content.starts_with("one")),
                "Scan from proxy: second" => assert!(msg.body.content.starts_with("two")),
                other => panic!("unexpected subject {other}"),
            }
        }
    }
}
