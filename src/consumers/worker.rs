//! A single consumer worker: one channel, prefetch 1, one delivery at a
//! time.

use crate::amqp::topology::declare_topology;
use crate::consumers::retry::{schedule_republish, RetryClient};
use crate::consumers::subscription::Subscription;
use crate::errors::{ErrorCode, RabbitMqError};
use crate::pool::RabbitPool;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Run one worker for `subscription` until its channel dies.
///
/// Setup failures are reported through the failure callback and end the
/// worker without touching the pool. A transport failure after setup
/// additionally signals the supervisor, which coalesces the signals from all
/// workers into a single pool rebuild. The worker's channel is closed on
/// every exit path.
pub(crate) async fn consume_task(
    slot: u32,
    pool: Arc<RabbitPool>,
    subscription: Arc<Subscription>,
) {
    let handler = Arc::clone(&subscription.handler);

    let Some(conn_slot) = pool.get_connection().await else {
        handler
            .on_failure(
                RabbitMqError::new(
                    ErrorCode::Connection,
                    "no broker connection available for worker",
                    "",
                ),
                None,
            )
            .await;
        return;
    };
    let channel = {
        let guard = conn_slot.conn.read().await;
        let Some(connection) = guard.as_ref() else {
            handler
                .on_failure(
                    RabbitMqError::new(
                        ErrorCode::ChannelCreate,
                        format!("connection slot {} holds no connection", conn_slot.index),
                        "",
                    ),
                    None,
                )
                .await;
            return;
        };
        match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                handler
                    .on_failure(
                        RabbitMqError::new(
                            ErrorCode::ChannelCreate,
                            "failed to open worker channel",
                            e.to_string(),
                        ),
                        None,
                    )
                    .await;
                return;
            }
        }
    };

    let live = &subscription.topology;
    let dead = live.dead_counterpart();

    if let Err(e) = declare_topology(&channel, live, None).await {
        handler.on_failure(e, None).await;
        close_channel(&channel).await;
        return;
    }
    // Declarations are idempotent, so every worker of a retry-enabled
    // subscription declares the dead topology.
    if subscription.retry_enabled {
        if let Err(e) = declare_topology(&channel, &dead, Some(live)).await {
            handler.on_failure(e, None).await;
            close_channel(&channel).await;
            return;
        }
    }

    // One unacked delivery at a time per worker.
    if let Err(e) = channel
        .basic_qos(1, BasicQosOptions { global: false })
        .await
    {
        handler
            .on_failure(
                RabbitMqError::new(
                    ErrorCode::GetChannel,
                    "failed to set channel prefetch",
                    e.to_string(),
                ),
                None,
            )
            .await;
        close_channel(&channel).await;
        return;
    }

    // Manual acknowledgement regardless of the subscription's auto-ack flag;
    // auto-ack is implemented by acking on receipt below.
    let mut consumer = match channel
        .basic_consume(
            &live.queue,
            &Uuid::new_v4().to_string(),
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(e) => {
            handler
                .on_failure(
                    RabbitMqError::new(
                        ErrorCode::GetChannel,
                        format!("failed to open consume stream for queue {}", live.queue),
                        e.to_string(),
                    ),
                    None,
                )
                .await;
            close_channel(&channel).await;
            return;
        }
    };

    debug!(queue = %live.queue, slot, "consumer worker online");

    loop {
        match consumer.next().await {
            Some(Ok(delivery)) => {
                handle_delivery(&pool, &subscription, &channel, &dead, delivery).await;
            }
            Some(Err(e)) => {
                handler
                    .on_failure(
                        RabbitMqError::new(
                            ErrorCode::Connection,
                            format!("delivery interrupted on queue {}", live.queue),
                            e.to_string(),
                        ),
                        None,
                    )
                    .await;
                pool.set_connect_error(RabbitMqError::new(
                    ErrorCode::Connection,
                    format!("consumer channel failed on queue {}", live.queue),
                    e.to_string(),
                ));
                break;
            }
            // The broker cancelled the consumer or the channel went away.
            None => {
                handler
                    .on_failure(
                        RabbitMqError::new(
                            ErrorCode::Connection,
                            format!("consume stream closed on queue {}", live.queue),
                            "",
                        ),
                        None,
                    )
                    .await;
                pool.set_connect_error(RabbitMqError::new(
                    ErrorCode::Connection,
                    format!("consume stream closed on queue {}", live.queue),
                    "",
                ));
                break;
            }
        }
    }

    close_channel(&channel).await;
}

async fn handle_delivery(
    pool: &Arc<RabbitPool>,
    subscription: &Arc<Subscription>,
    channel: &lapin::Channel,
    dead: &crate::amqp::topology::Topology,
    delivery: Delivery,
) {
    if subscription.auto_ack {
        if let Err(e) = delivery.acker.ack(BasicAckOptions { multiple: true }).await {
            warn!(error = %e, "failed to auto-ack delivery");
        }
    }

    let retry = RetryClient::new(
        channel.clone(),
        delivery,
        dead.clone(),
        Arc::clone(pool),
        Arc::clone(subscription),
    );
    let handled = subscription
        .handler
        .on_message(retry.body(), retry.headers(), &retry)
        .await;
    if handled || !subscription.retry_enabled {
        return;
    }

    let next = retry.observed_retries() + 1;
    if next >= subscription.max_retries {
        subscription
            .handler
            .on_failure(RabbitMqError::retry_max(), Some(retry.body()))
            .await;
    } else {
        schedule_republish(
            channel.clone(),
            dead.clone(),
            retry.body().to_vec(),
            next,
            pool.retry_window(),
            Arc::clone(&subscription.handler),
        );
    }
}

async fn close_channel(channel: &lapin::Channel) {
    if let Err(e) = channel.close(200, "consumer worker exit").await {
        debug!(error = %e, "worker channel already closed");
    }
}
