//! End-to-end scenarios against a real broker.
//!
//! These tests need a RabbitMQ instance on `localhost:5672` with the default
//! `guest`/`guest` credentials (e.g. the official Docker image) and are
//! ignored by default:
//!
//! ```text
//! cargo test -- --ignored
//! ```

use async_trait::async_trait;
use burrow::{
    init_pool, retry_count, AmqpConfig, ConsumeHandler, ErrorCode, ExchangeKind, FieldTable,
    PoolRole, PushMessage, RabbitMqError, RabbitPool, RetryClient, Spool, Subscription, Topology,
};
use lapin::options::BasicGetOptions;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn test_config(role: PoolRole) -> AmqpConfig {
    AmqpConfig::default().with_role(role)
}

fn unique_topology() -> Topology {
    let tag = Uuid::new_v4();
    Topology::new(
        format!("ex-{tag}"),
        ExchangeKind::Direct,
        format!("q-{tag}"),
        format!("rk-{tag}"),
    )
}

/// A raw channel for observing queues from the outside.
async fn raw_channel() -> lapin::Channel {
    let connection = lapin::Connection::connect_uri(
        test_config(PoolRole::Producer).amqp_uri(),
        lapin::ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current()),
    )
    .await
    .expect("failed to connect to the test broker");
    connection
        .create_channel()
        .await
        .expect("failed to open a channel")
}

async fn fetch_one(queue: &str) -> Option<Vec<u8>> {
    let channel = raw_channel().await;
    let message = channel
        .basic_get(queue, BasicGetOptions { no_ack: true })
        .await
        .expect("basic_get failed");
    message.map(|m| m.delivery.data)
}

/// Scripted handler: answers `on_message` from a queue of verdicts and
/// records everything it sees.
struct ScriptedHandler {
    verdicts: Mutex<VecDeque<bool>>,
    deliveries: mpsc::UnboundedSender<i32>,
    failures: mpsc::UnboundedSender<u16>,
}

impl ScriptedHandler {
    fn new(
        verdicts: impl IntoIterator<Item = bool>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<i32>,
        mpsc::UnboundedReceiver<u16>,
    ) {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            deliveries: deliveries_tx,
            failures: failures_tx,
        });
        (handler, deliveries_rx, failures_rx)
    }
}

#[async_trait]
impl ConsumeHandler for ScriptedHandler {
    async fn on_message(
        &self,
        _body: &[u8],
        headers: Option<&FieldTable>,
        retry: &RetryClient,
    ) -> bool {
        let _ = self.deliveries.send(retry_count(headers));
        let handled = self.verdicts.lock().unwrap().pop_front().unwrap_or(false);
        if handled {
            retry.ack().await.expect("failed to ack delivery");
        }
        handled
    }

    async fn on_failure(&self, error: RabbitMqError, _body: Option<&[u8]>) {
        let _ = self.failures.send(error.code().value());
    }
}

async fn consumer_pool_with(
    subscription: Subscription,
    workers: u32,
) -> Arc<RabbitPool> {
    let pool = Arc::new(RabbitPool::consumer());
    pool.set_max_connections(2);
    pool.set_max_consume_channels(workers);
    pool.set_random_retry_time(100, 200);
    pool.connect(&test_config(PoolRole::Consumer))
        .await
        .expect("failed to connect consumer pool");
    pool.register_subscription(subscription);
    let runner = Arc::clone(&pool);
    tokio::spawn(async move {
        runner
            .run_consume()
            .await
            .expect("consumer runtime exited");
    });
    pool
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn pool_connects_and_reports_healthy() {
    let pool = init_pool(&test_config(PoolRole::Producer))
        .await
        .expect("failed to initialise pool");

    assert!(pool.is_healthy().await);

    pool.close().await;
    assert!(!pool.is_healthy().await);
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn happy_publish_reaches_the_bound_queue() {
    // Arrange
    let pool = Arc::new(RabbitPool::producer());
    pool.set_max_connections(2);
    pool.connect(&test_config(PoolRole::Producer))
        .await
        .expect("failed to connect producer pool");
    let topology = unique_topology();

    // Act
    pool.push(&PushMessage::new(topology.clone(), "hello"))
        .await
        .expect("push failed");

    // Assert
    let body = fetch_one(&topology.queue).await.expect("queue was empty");
    assert_eq!(body, b"hello");
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn publish_recovers_after_connections_are_killed() {
    // Arrange
    let pool = Arc::new(RabbitPool::producer());
    pool.set_max_connections(2);
    pool.connect(&test_config(PoolRole::Producer))
        .await
        .expect("failed to connect producer pool");
    let topology = unique_topology();
    pool.push(&PushMessage::new(topology.clone(), "before"))
        .await
        .expect("first push failed");

    // Act: kill every pooled connection, then publish again.
    pool.close().await;
    pool.push(&PushMessage::new(topology.clone(), "after"))
        .await
        .expect("push after reconnect failed");

    // Assert: both publishes are broker-visible.
    assert_eq!(fetch_one(&topology.queue).await.unwrap(), b"before");
    assert_eq!(fetch_one(&topology.queue).await.unwrap(), b"after");
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn declined_deliveries_are_retried_then_acked() {
    // Arrange: decline twice, accept the third attempt.
    let (handler, mut deliveries, mut failures) = ScriptedHandler::new([false, false, true]);
    let topology = unique_topology();
    let subscription =
        Subscription::new(topology.clone(), handler).with_retry(3);
    let _pool = consumer_pool_with(subscription, 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Act
    let producer = Arc::new(RabbitPool::producer());
    producer.set_max_connections(1);
    producer
        .connect(&test_config(PoolRole::Producer))
        .await
        .expect("failed to connect producer pool");
    producer
        .push(&PushMessage::new(topology.clone(), "retry me"))
        .await
        .expect("push failed");

    // Assert: three deliveries with monotonically increasing retry counters,
    // and the failure callback never fires.
    let mut counters = Vec::new();
    for _ in 0..3 {
        let counter = tokio::time::timeout(Duration::from_secs(10), deliveries.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("delivery stream closed");
        counters.push(counter);
    }
    assert_eq!(counters, vec![0, 1, 2]);
    assert!(failures.try_recv().is_err());
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn retry_exhaustion_fires_the_failure_callback_once() {
    // Arrange: decline every delivery.
    let (handler, mut deliveries, mut failures) = ScriptedHandler::new(vec![]);
    let topology = unique_topology();
    let subscription =
        Subscription::new(topology.clone(), handler).with_retry(3);
    let _pool = consumer_pool_with(subscription, 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Act
    let producer = Arc::new(RabbitPool::producer());
    producer.set_max_connections(1);
    producer
        .connect(&test_config(PoolRole::Producer))
        .await
        .expect("failed to connect producer pool");
    producer
        .push(&PushMessage::new(topology.clone(), "poison"))
        .await
        .expect("push failed");

    // Assert: counters 0, 1, 2 are observed, then exactly one 507.
    for expected in 0..3 {
        let counter = tokio::time::timeout(Duration::from_secs(10), deliveries.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("delivery stream closed");
        assert_eq!(counter, expected);
    }
    let code = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .expect("timed out waiting for the failure callback")
        .expect("failure stream closed");
    assert_eq!(code, ErrorCode::RetryMax.value());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(deliveries.try_recv().is_err(), "payload was republished past the ceiling");
    assert!(failures.try_recv().is_err(), "failure callback fired more than once");
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn supervisor_rebuilds_the_pool_after_worker_channels_die() {
    // Arrange: a full complement of workers that ack everything.
    struct AckingHandler {
        deliveries: mpsc::UnboundedSender<Vec<u8>>,
    }
    #[async_trait]
    impl ConsumeHandler for AckingHandler {
        async fn on_message(
            &self,
            body: &[u8],
            _headers: Option<&FieldTable>,
            retry: &RetryClient,
        ) -> bool {
            let _ = self.deliveries.send(body.to_vec());
            retry.ack().await.expect("failed to ack delivery");
            true
        }
        async fn on_failure(&self, _error: RabbitMqError, _body: Option<&[u8]>) {}
    }

    let (deliveries_tx, mut deliveries_rx) = mpsc::unbounded_channel();
    let topology = unique_topology();
    let subscription = Subscription::new(
        topology.clone(),
        Arc::new(AckingHandler {
            deliveries: deliveries_tx,
        }),
    );
    let pool = consumer_pool_with(subscription, 25).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Act: kill every connection; all 25 worker streams end at once.
    pool.close().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Assert: the rebuilt workers consume a fresh message.
    let producer = Arc::new(RabbitPool::producer());
    producer.set_max_connections(1);
    producer
        .connect(&test_config(PoolRole::Producer))
        .await
        .expect("failed to connect producer pool");
    producer
        .push(&PushMessage::new(topology.clone(), "after rebuild"))
        .await
        .expect("push failed");

    let body = tokio::time::timeout(Duration::from_secs(10), deliveries_rx.recv())
        .await
        .expect("rebuilt workers never consumed")
        .expect("delivery stream closed");
    assert_eq!(body, b"after rebuild");
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn exhausted_push_lands_in_the_spool() {
    // Arrange: a pool whose retry budget is already spent, so the first
    // attempt goes straight to the spool.
    let pool = Arc::new(RabbitPool::producer());
    pool.set_push_max_retries(1);
    pool.connect(&test_config(PoolRole::Producer))
        .await
        .expect("failed to connect producer pool");
    let spool = Arc::new(Spool::new(
        std::env::temp_dir().join(format!("burrow-e2e-{}.txt", Uuid::new_v4())),
    ));
    let message =
        PushMessage::new(unique_topology(), "x").with_spool(Arc::clone(&spool));

    // Act
    let error = pool.push(&message).await.unwrap_err();

    // Assert
    assert_eq!(error.code(), ErrorCode::PushMax);
    let contents = std::fs::read_to_string(spool.path()).unwrap();
    assert_eq!(contents, "x\n");
    std::fs::remove_file(spool.path()).unwrap();
}
