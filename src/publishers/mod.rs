//! The publish path: round-robin connection selection, cached channels,
//! bounded retries, and a spool handoff once retries run out.

use crate::amqp::factory::HealthStatus;
use crate::amqp::topology::Topology;
use crate::errors::{ErrorCode, RabbitMqError};
use crate::pool::{ConnectionSlot, RabbitPool, PUBLISH_TIMEOUT, RECONNECT_BACKOFF};
use crate::spool::Spool;
use lapin::{options::BasicPublishOptions, BasicProperties};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, warn};

/// A payload to publish, together with its topology and the spool that
/// receives it if every publish attempt fails.
#[derive(Clone)]
pub struct PushMessage {
    pub topology: Topology,
    /// One UTF-8 record; spooled as a single line on exhaustion.
    pub body: String,
    pub spool: Option<Arc<Spool>>,
}

impl PushMessage {
    pub fn new(topology: Topology, body: impl Into<String>) -> Self {
        Self {
            topology,
            body: body.into(),
            spool: None,
        }
    }

    /// Attach the write-ahead spool that captures the payload when publish
    /// retries are exhausted.
    #[must_use]
    pub fn with_spool(mut self, spool: Arc<Spool>) -> Self {
        self.spool = Some(spool);
        self
    }
}

impl RabbitPool {
    /// Publish `message`, retrying on failure up to the configured limit.
    ///
    /// Each attempt is bounded by a 5 s deadline; failed attempts back off
    /// for 2 s before retrying. Once retries are exhausted the payload is
    /// appended to the message's spool (when present) and
    /// [`ErrorCode::PushMax`] is returned.
    pub async fn push(&self, message: &PushMessage) -> Result<(), RabbitMqError> {
        self.push_inner(message, std::future::pending()).await
    }

    /// Like [`push`](Self::push), but gives up as soon as `cancel` resolves.
    ///
    /// Cancellation surfaces as [`ErrorCode::Connection`]; an attempt already
    /// on the wire is not recalled.
    pub async fn push_with_cancel(
        &self,
        message: &PushMessage,
        cancel: impl Future<Output = ()>,
    ) -> Result<(), RabbitMqError> {
        self.push_inner(message, cancel).await
    }

    async fn push_inner(
        &self,
        message: &PushMessage,
        cancel: impl Future<Output = ()>,
    ) -> Result<(), RabbitMqError> {
        tokio::pin!(cancel);
        let max_attempts = self.push_max_retries().max(1);
        let mut attempt = 1;
        loop {
            if attempt >= max_attempts {
                if let Some(spool) = &message.spool {
                    if let Err(e) = spool.append(&message.body) {
                        error!(error = %e, path = %spool.path().display(), "failed to spool payload");
                    }
                }
                return Err(RabbitMqError::new(
                    ErrorCode::PushMax,
                    "publish retries exhausted",
                    format!("gave up after {attempt} attempts"),
                ));
            }

            // Acquire and declare under the channel lock, publish outside it.
            let channel = self.acquire_publish_channel(&message.topology).await?;

            let publish = async {
                let properties = BasicProperties::default()
                    .with_content_type("text/plain".into())
                    .with_delivery_mode(2);
                channel
                    .basic_publish(
                        &message.topology.exchange,
                        &message.topology.routing_key,
                        BasicPublishOptions {
                            mandatory: false,
                            immediate: false,
                        },
                        message.body.as_bytes(),
                        properties,
                    )
                    .await?
                    .await
            };

            let outcome = tokio::select! {
                biased;
                _ = &mut cancel => {
                    return Err(RabbitMqError::new(
                        ErrorCode::Connection,
                        "publish cancelled by caller",
                        "",
                    ));
                }
                outcome = tokio::time::timeout(PUBLISH_TIMEOUT, publish) => outcome,
            };
            match outcome {
                Ok(Ok(_confirmation)) => return Ok(()),
                Ok(Err(e)) => warn!(error = %e, attempt, "publish failed; will retry"),
                Err(_) => warn!(attempt, "publish timed out; will retry"),
            }

            self.push_current_retry.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    return Err(RabbitMqError::new(
                        ErrorCode::Connection,
                        "publish cancelled by caller",
                        "",
                    ));
                }
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
            attempt += 1;
        }
    }

    /// Pick a connection, repair it if it has gone down, and return a
    /// declared channel for `topology`.
    ///
    /// Holds the channel lock for the whole acquire+declare sequence; the
    /// lock is released before the caller publishes.
    async fn acquire_publish_channel(
        &self,
        topology: &Topology,
    ) -> Result<lapin::Channel, RabbitMqError> {
        let mut channels = self.channels.write().await;
        let slot = self.get_connection().await.ok_or_else(|| {
            RabbitMqError::new(ErrorCode::GetChannel, "no broker connection available", "")
        })?;
        let reconnected = self.try_reconnect(&slot, topology, &mut channels).await?;
        self.get_or_declare_channel(&mut channels, &slot, topology, reconnected)
            .await
    }

    /// Repair `slot` if its connection is gone or closed.
    ///
    /// Returns whether a reconnect happened, in which case the cached channel
    /// for `topology` has been evicted and the caller must treat any prior
    /// channel as stale. Redials are bounded by the product retry limit with
    /// a 2 s back-off between attempts.
    async fn try_reconnect(
        &self,
        slot: &Arc<ConnectionSlot>,
        topology: &Topology,
        channels: &mut HashMap<u64, crate::pool::CachedChannel>,
    ) -> Result<bool, RabbitMqError> {
        {
            let conn = slot.conn.read().await;
            if conn
                .as_ref()
                .is_some_and(|c| c.status() == HealthStatus::Healthy)
            {
                return Ok(false);
            }
        }

        // The cached channel belonged to the dead connection.
        self.evict_channel(channels, slot.index, topology).await;

        let factory = self.factory()?;
        let max_attempts = self.product_max_retries().max(1);
        let mut attempt = 0;
        loop {
            match factory.new_connection().await {
                Ok(connection) => {
                    *slot.conn.write().await = Some(connection);
                    return Ok(true);
                }
                Err(e) => {
                    attempt += 1;
                    self.product_current_retry.fetch_add(1, Ordering::Relaxed);
                    if attempt >= max_attempts {
                        return Err(RabbitMqError::new(
                            ErrorCode::Connection,
                            "reconnect attempts exhausted",
                            e.to_string(),
                        ));
                    }
                    warn!(error = %e, attempt, index = slot.index, "redial failed; retrying in 2s");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }
}
