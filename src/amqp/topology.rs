//! The exchange/queue/binding triple a channel is declared for, and the
//! cache key derived from it.

use crate::amqp::configuration::PoolRole;
use crate::errors::{ErrorCode, RabbitMqError};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use std::fmt;

/// The exchange kinds supported by the pool.
///
/// The wire form is the lowercase name. Custom exchange kinds are not
/// representable: a producer can only ever declare one of these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }

    pub(crate) fn to_lapin(self) -> lapin::ExchangeKind {
        match self {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange, the queue bound to it, and the routing key between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    /// May be empty, e.g. for fanout exchanges.
    pub routing_key: String,
}

impl Topology {
    pub fn new(
        exchange: impl Into<String>,
        kind: ExchangeKind,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// The parallel dead-letter topology for this one.
    ///
    /// Dead exchanges are always `direct` regardless of the live kind, and an
    /// empty routing key stays empty so fanout subscriptions keep working.
    pub fn dead_counterpart(&self) -> Topology {
        let routing_key = if self.routing_key.is_empty() {
            String::new()
        } else {
            format!("{}-dead", self.routing_key)
        };
        Topology {
            exchange: format!("{}-dead", self.exchange),
            kind: ExchangeKind::Direct,
            queue: format!("{}-dead", self.queue),
            routing_key,
        }
    }
}

/// Cache key for a channel declared against `topology` on connection
/// `conn_index` of a pool with the given role.
///
/// The key is the CRC-32 of the joined fields widened to 64 bits, so it is
/// deterministic across runs and never negative. CRC collisions are
/// tolerated: the key space is per-process and small.
pub(crate) fn channel_key(role: PoolRole, conn_index: u32, topology: &Topology) -> u64 {
    u64::from(crc32fast::hash(
        key_material(role, conn_index, topology).as_bytes(),
    ))
}

fn key_material(role: PoolRole, conn_index: u32, topology: &Topology) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}",
        role.key(),
        conn_index,
        topology.exchange,
        topology.kind,
        topology.queue,
        topology.routing_key
    )
}

/// Declare `topology` on `channel`: durable exchange, durable queue, binding.
///
/// When `dead_letter_target` is set, the queue is declared with
/// `x-dead-letter-exchange` (and, for a non-empty routing key,
/// `x-dead-letter-routing-key`) pointing back at the given live topology, so
/// expired messages re-enter the live flow.
pub(crate) async fn declare_topology(
    channel: &lapin::Channel,
    topology: &Topology,
    dead_letter_target: Option<&Topology>,
) -> Result<(), RabbitMqError> {
    channel
        .exchange_declare(
            &topology.exchange,
            topology.kind.to_lapin(),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declare_error("failed to declare exchange", &topology.exchange, e))?;

    let mut arguments = FieldTable::default();
    if let Some(live) = dead_letter_target {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(live.exchange.as_str().into()),
        );
        let route = live.routing_key.trim();
        if !route.is_empty() {
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(route.into()),
            );
        }
    }

    let queue = channel
        .queue_declare(
            &topology.queue,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            arguments,
        )
        .await
        .map_err(|e| declare_error("failed to declare queue", &topology.queue, e))?;

    channel
        .queue_bind(
            queue.name().as_str(),
            &topology.exchange,
            &topology.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declare_error("failed to bind queue", &topology.queue, e))?;

    Ok(())
}

fn declare_error(message: &str, name: &str, source: lapin::Error) -> RabbitMqError {
    RabbitMqError::new(
        ErrorCode::DeclareBind,
        format!("{message} {name}"),
        source.to_string(),
    )
}
