//! The error taxonomy shared by producers and consumers.
//!
//! Every failure surfaced through the public API carries one of the seven
//! numeric codes below, so callers can branch on the class of failure without
//! string-matching broker errors.

use std::fmt;

/// Numeric classification of a [`RabbitMqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Publish retries were exhausted; the payload has been handed to the
    /// local spool when one was attached to the message.
    PushMax = 501,
    /// A channel could not be obtained from the cache or the broker.
    GetChannel = 502,
    /// Declaring or binding the exchange/queue topology failed.
    DeclareBind = 503,
    /// The broker connection failed or the operation was cancelled.
    Connection = 504,
    /// A publish was refused by the broker.
    Push = 505,
    /// Opening a new channel on an established connection failed.
    ChannelCreate = 506,
    /// A delivery reached its per-subscription retry ceiling.
    RetryMax = 507,
}

impl ErrorCode {
    /// The wire-facing numeric value of the code.
    pub fn value(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Error returned by pool, publish and consume operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Exception ({code}) Reason: {message:?}")]
pub struct RabbitMqError {
    code: ErrorCode,
    message: String,
    detail: String,
}

impl RabbitMqError {
    pub fn new(code: ErrorCode, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Underlying broker/client error text, when one was captured.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub(crate) fn retry_max() -> Self {
        Self::new(ErrorCode::RetryMax, "maximum number of retries exceeded", "")
    }
}

/// Error returned by [`RetryClient::ack`](crate::consumers::RetryClient::ack).
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// There is no delivery associated with this client.
    #[error("no delivery to acknowledge")]
    MissingDelivery,
    /// The broker rejected the acknowledgement.
    #[error("failed to acknowledge delivery")]
    Broker(#[from] lapin::Error),
}
