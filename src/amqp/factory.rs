use crate::amqp::configuration::AmqpConfig;
use lapin::{uri::AMQPUri, ConnectionProperties};
use tracing::warn;

/// All the information required to connect to a RabbitMq broker.
///
/// No timeout is imposed at dial time: transient dial failures are handled by
/// the pool's monitor loop and the consumer supervisor, which retry with
/// back-off.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
}

impl ConnectionFactory {
    pub fn new_from_config(config: &AmqpConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
        }
    }

    /// Create a new connection to a RabbitMq broker.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<Connection, lapin::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = lapin::Connection::connect_uri(self.uri.clone(), properties).await?;
        // Log connection-level failures; recovery is driven elsewhere.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(Connection(connection))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// A connection to a RabbitMq broker.
///
/// Connections are re-used across many channels given their setup cost; the
/// pool keeps a fixed number of them alive and multiplexes all traffic over
/// that set.
pub struct Connection(lapin::Connection);

impl Connection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    pub async fn create_channel(&self) -> Result<lapin::Channel, lapin::Error> {
        self.0.create_channel().await
    }

    pub fn status(&self) -> HealthStatus {
        if self.0.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub async fn close(&self) -> Result<(), lapin::Error> {
        self.0.close(200, "closed by pool").await
    }
}

impl AsRef<lapin::Connection> for Connection {
    fn as_ref(&self) -> &lapin::Connection {
        &self.0
    }
}
