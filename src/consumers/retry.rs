//! Per-delivery retry plumbing.
//!
//! Declined deliveries are republished to the subscription's dead exchange
//! with a randomised per-message TTL; when the TTL elapses the broker routes
//! the message back to the live exchange via the `x-dead-letter-exchange`
//! argument on the dead queue. Delayed redelivery therefore needs no
//! client-side timers, and the TTL spread disperses retry storms after an
//! outage.

use crate::amqp::convenience::{retry_count, retry_headers};
use crate::amqp::topology::Topology;
use crate::consumers::subscription::{ConsumeHandler, Subscription};
use crate::errors::{AckError, RabbitMqError};
use crate::pool::{RabbitPool, PUBLISH_TIMEOUT};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicPublishOptions},
    types::FieldTable,
    BasicProperties,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Delay before a declined delivery is republished to the dead exchange.
const REPUBLISH_DELAY: Duration = Duration::from_millis(200);
/// TTL applied when the configured window is inverted.
const FALLBACK_EXPIRATION_MS: u64 = 5000;

/// Handed to [`ConsumeHandler::on_message`] for each delivery.
///
/// Bound to the worker's channel and the subscription's dead topology, it
/// acknowledges the delivery and requeues payloads through the dead-letter
/// pipeline.
pub struct RetryClient {
    channel: lapin::Channel,
    delivery: Option<Delivery>,
    dead: Topology,
    pool: Arc<RabbitPool>,
    subscription: Arc<Subscription>,
}

impl RetryClient {
    pub(crate) fn new(
        channel: lapin::Channel,
        delivery: Delivery,
        dead: Topology,
        pool: Arc<RabbitPool>,
        subscription: Arc<Subscription>,
    ) -> Self {
        Self {
            channel,
            delivery: Some(delivery),
            dead,
            pool,
            subscription,
        }
    }

    /// The delivery's payload.
    pub fn body(&self) -> &[u8] {
        self.delivery
            .as_ref()
            .map(|d| d.data.as_slice())
            .unwrap_or_default()
    }

    /// The delivery's headers, when any were set.
    pub fn headers(&self) -> Option<&FieldTable> {
        self.delivery
            .as_ref()
            .and_then(|d| d.properties.headers().as_ref())
    }

    /// How many retries this delivery has been through already.
    pub fn observed_retries(&self) -> i32 {
        retry_count(self.headers())
    }

    /// Acknowledge the delivery.
    ///
    /// A no-op on auto-ack subscriptions, where the worker already acked on
    /// receipt. Fails with [`AckError::MissingDelivery`] when there is no
    /// delivery to acknowledge.
    pub async fn ack(&self) -> Result<(), AckError> {
        if self.subscription.auto_ack {
            return Ok(());
        }
        match &self.delivery {
            Some(delivery) => {
                delivery
                    .acker
                    .ack(BasicAckOptions { multiple: true })
                    .await?;
                Ok(())
            }
            None => Err(AckError::MissingDelivery),
        }
    }

    /// Requeue `body` through the dead-letter pipeline.
    ///
    /// The republished message carries a retry counter one above the one
    /// observed on this delivery. At the subscription's ceiling the payload
    /// is not republished; the failure callback fires with code 507 instead.
    pub async fn push(&self, body: Vec<u8>) {
        let next = self.observed_retries() + 1;
        if next >= self.subscription.max_retries {
            self.subscription
                .handler
                .on_failure(RabbitMqError::retry_max(), Some(&body))
                .await;
        } else {
            schedule_republish(
                self.channel.clone(),
                self.dead.clone(),
                body,
                next,
                self.pool.retry_window(),
                Arc::clone(&self.subscription.handler),
            );
        }
    }
}

/// Fire-and-forget republish of `body` to the dead exchange.
///
/// Sleeps briefly first so an immediately-requeued message does not race its
/// own acknowledgement, then publishes with the updated retry counter and a
/// TTL drawn uniformly from `window`. A failed republish is surfaced through
/// the failure callback with code 507.
pub(crate) fn schedule_republish(
    channel: lapin::Channel,
    dead: Topology,
    body: Vec<u8>,
    retry: i32,
    window: (u64, u64),
    handler: Arc<dyn ConsumeHandler>,
) {
    tokio::spawn(async move {
        tokio::time::sleep(REPUBLISH_DELAY).await;

        let expiration = random_expiration(window.0, window.1);
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_delivery_mode(2)
            .with_expiration(expiration.to_string().into())
            .with_headers(retry_headers(retry));

        let publish = async {
            channel
                .basic_publish(
                    &dead.exchange,
                    &dead.routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await?
                .await
        };
        let failed = match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                warn!(error = %e, exchange = %dead.exchange, "dead-exchange republish failed");
                true
            }
            Err(_) => {
                warn!(exchange = %dead.exchange, "dead-exchange republish timed out");
                true
            }
        };
        if failed {
            handler
                .on_failure(RabbitMqError::retry_max(), Some(&body))
                .await;
        }
    });
}

/// A TTL drawn uniformly from `[min, max]` milliseconds.
pub(crate) fn random_expiration(min: u64, max: u64) -> u64 {
    if min > max {
        return FALLBACK_EXPIRATION_MS;
    }
    rand::thread_rng().gen_range(min..=max)
}
