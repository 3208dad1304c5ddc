use crate::amqp::topology::Topology;
use crate::consumers::retry::RetryClient;
use crate::errors::RabbitMqError;
use lapin::types::FieldTable;
use std::sync::Arc;

/// Message-processing callbacks for a [`Subscription`].
#[async_trait::async_trait]
pub trait ConsumeHandler: Send + Sync + 'static {
    /// Called once per delivery.
    ///
    /// Return `true` when the message has been dealt with. Returning `false`
    /// on a retry-enabled subscription republishes the payload through the
    /// dead-letter pipeline (or, at the retry ceiling, routes it to
    /// [`on_failure`](Self::on_failure) with code 507).
    ///
    /// `retry` is bound to the worker's channel and the subscription's dead
    /// topology: use it to ack manually-acknowledged deliveries and to
    /// requeue payloads explicitly.
    async fn on_message(
        &self,
        body: &[u8],
        headers: Option<&FieldTable>,
        retry: &RetryClient,
    ) -> bool;

    /// Called on terminal failures: transport errors (code 504), topology or
    /// channel setup failures (502/503/506), and retry exhaustion (507).
    ///
    /// `body` is the affected payload when one is in scope.
    async fn on_failure(&self, error: RabbitMqError, body: Option<&[u8]>);
}

/// A registered consumer: a topology, the handler invoked for its
/// deliveries, and the retry policy applied when the handler declines a
/// message. Immutable once registered.
#[derive(Clone)]
pub struct Subscription {
    pub topology: Topology,
    pub handler: Arc<dyn ConsumeHandler>,
    /// Declare the dead topology and republish declined deliveries.
    pub retry_enabled: bool,
    /// Ceiling for the per-message retry counter.
    pub max_retries: i32,
    /// Acknowledge deliveries as soon as they arrive, before the handler
    /// runs.
    pub auto_ack: bool,
}

impl Subscription {
    pub fn new(topology: Topology, handler: Arc<dyn ConsumeHandler>) -> Self {
        Self {
            topology,
            handler,
            retry_enabled: false,
            max_retries: 0,
            auto_ack: false,
        }
    }

    /// Enable the dead-letter retry pipeline with the given per-message
    /// ceiling.
    #[must_use]
    pub fn with_retry(mut self, max_retries: i32) -> Self {
        self.retry_enabled = true;
        self.max_retries = max_retries;
        self
    }

    /// Acknowledge deliveries on receipt instead of through
    /// [`RetryClient::ack`].
    #[must_use]
    pub fn with_auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }
}
