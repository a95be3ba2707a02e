//! The client: the factory that owns the connection pool and hands out cached entity
//! handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use battenberg_amqp::configuration::ServiceBusSettings;
use battenberg_amqp::transport::{AmqpTransport, ConnectionFactory};
use battenberg_amqp_pool::{ConnectionPool, PoolOptions};

use crate::queue::QueueClient;
use crate::topic::TopicClient;

/// A client for one Service Bus namespace.
///
/// The client owns the connection pool shared by every sender and receiver it hands out.
/// [`queue`](Self::queue) and [`topic`](Self::topic) return cached handles - one instance
/// per distinct entity name for the lifetime of the client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use battenberg::ServiceBusClient;
/// use battenberg_amqp::transport::AmqpTransport;
///
/// fn example(transport: Arc<dyn AmqpTransport>) -> anyhow::Result<()> {
///     let client = ServiceBusClient::from_connection_string(
///         "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k",
///         transport,
///     )?;
///     let orders = client.queue("orders");
///     # let _ = orders;
///     Ok(())
/// }
/// ```
pub struct ServiceBusClient {
    pool: ConnectionPool,
    queues: Mutex<HashMap<String, Arc<QueueClient>>>,
    topics: Mutex<HashMap<String, Arc<TopicClient>>>,
}

impl ServiceBusClient {
    /// Build a client from a connection string
    /// (`Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`) and the AMQP
    /// engine to dial with.
    pub fn from_connection_string(
        connection_string: &str,
        transport: Arc<dyn AmqpTransport>,
    ) -> Result<Self, anyhow::Error> {
        let settings = ServiceBusSettings::from_connection_string(connection_string)?;
        Ok(Self::from_settings(settings, transport))
    }

    pub fn from_settings(settings: ServiceBusSettings, transport: Arc<dyn AmqpTransport>) -> Self {
        Self::new(ConnectionPool::new(ConnectionFactory::new(
            transport, settings,
        )))
    }

    /// Build a client over a pre-configured pool (custom link budget or idle delay).
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            queues: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pool_options(
        settings: ServiceBusSettings,
        transport: Arc<dyn AmqpTransport>,
        options: PoolOptions,
    ) -> Self {
        Self::new(ConnectionPool::with_options(
            ConnectionFactory::new(transport, settings),
            options,
        ))
    }

    /// The handle for a queue. Cached: the same name returns the same instance.
    pub fn queue(&self, name: &str) -> Arc<QueueClient> {
        self.queues
            .lock()
            .expect("queue cache lock poisoned")
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(QueueClient::new(self.pool.clone(), name.to_owned())))
            .clone()
    }

    /// The handle for a topic. Cached: the same name returns the same instance.
    pub fn topic(&self, name: &str) -> Arc<TopicClient> {
        self.topics
            .lock()
            .expect("topic cache lock poisoned")
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(TopicClient::new(self.pool.clone(), name.to_owned())))
            .clone()
    }

    /// Tear down the connection pool, invalidating every handle created from this client.
    pub async fn dispose(&self) {
        self.pool.dispose().await;
    }
}
