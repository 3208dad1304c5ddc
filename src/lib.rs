//! `burrow` wraps [`lapin`], our AMQP client, with the plumbing a service
//! needs to talk to RabbitMQ all day: a fixed-size pool of long-lived broker
//! connections, a cache of declared channels keyed by topology, a publish
//! path that retries and spools, and a supervised consumer runtime with a
//! dead-letter retry pipeline.
//!
//! [`init_pool`] is the entrypoint for both sides:
//!
//! * producers call [`RabbitPool::push`] (or
//!   [`RabbitPool::push_with_cancel`]) with a [`PushMessage`];
//! * consumers register [`Subscription`]s and hand control to
//!   [`RabbitPool::run_consume`], which fans out workers and rebuilds the
//!   pool on transport failure.
//!
//! Delivery is at-least-once: publishes use persistent delivery mode but no
//! publisher confirms, and consumers see each message until it is
//! acknowledged. Callers that need stronger guarantees must layer them on
//! top.
//!
//! [`lapin`]: https://docs.rs/crate/lapin

pub mod amqp;
pub mod consumers;
pub mod errors;
pub mod pool;
pub mod publishers;
pub mod spool;

pub use amqp::configuration::{AmqpConfig, PoolRole};
pub use amqp::convenience::{retry_count, retry_headers, RETRY_COUNT_HEADER};
pub use amqp::topology::{ExchangeKind, Topology};
pub use amqp::HealthStatus;
pub use consumers::{ConsumeHandler, RetryClient, Subscription};
pub use errors::{AckError, ErrorCode, RabbitMqError};
pub use pool::{init_pool, BalanceStrategy, RabbitPool};
pub use publishers::PushMessage;
pub use spool::Spool;

// Handlers receive raw header tables; re-export the type so users do not
// need `lapin` as a direct dependency.
pub use lapin::types::FieldTable;
