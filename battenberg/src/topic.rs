//! The topic handle: sending to the topic, receiving from its subscriptions and their
//! dead-letter sub-entities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use battenberg_amqp::transport::LinkEvent;
use battenberg_amqp_pool::ConnectionPool;
use tokio::sync::broadcast;

use crate::constants::{DEFAULT_SEND_TIMEOUT, SERVICE_BUS_SERVER_TIMEOUT};
use crate::message::{BrokeredMessage, ReceivedMessage};
use crate::queue::dead_letter_path;
use crate::receivers::{
    BatchReceiveError, MessageHandler, MessageListener, OnMessageOptions, Receiver,
};
use crate::senders::{SendError, Sender};

/// A handle to one topic.
///
/// Obtained from [`ServiceBusClient::topic`](crate::ServiceBusClient::topic). Sending
/// addresses the topic itself; every receive-side operation names a subscription, and the
/// handle caches one receiver per subscription plus one per subscription dead-letter
/// sub-entity.
pub struct TopicClient {
    name: String,
    pool: ConnectionPool,
    sender: Sender,
    receivers: Mutex<HashMap<String, Arc<Receiver>>>,
}

impl TopicClient {
    pub(crate) fn new(pool: ConnectionPool, name: String) -> Self {
        let sender = Sender::new(pool.clone(), name.clone());
        Self {
            name,
            pool,
            sender,
            receivers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a message to the topic with the default timeout (15 seconds).
    pub async fn send(&self, message: &BrokeredMessage) -> Result<(), SendError> {
        self.sender.send(message, DEFAULT_SEND_TIMEOUT).await
    }

    pub async fn send_with_timeout(
        &self,
        message: &BrokeredMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        self.sender.send(message, timeout).await
    }

    pub async fn can_send(&self) -> bool {
        self.sender.can_send().await
    }

    pub async fn dispose_sender(&self) {
        self.sender.dispose().await
    }

    pub fn sender_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.events()
    }

    /// Stream messages from `subscription` to `handler`.
    pub fn on_message(
        &self,
        subscription: &str,
        handler: impl MessageHandler,
        options: OnMessageOptions,
    ) -> MessageListener {
        self.receiver(subscription_path(&self.name, subscription))
            .on_message(Arc::new(handler), options)
    }

    /// Stream messages from `subscription`'s dead-letter sub-queue to `handler`.
    pub fn on_dead_lettered_message(
        &self,
        subscription: &str,
        handler: impl MessageHandler,
        options: OnMessageOptions,
    ) -> MessageListener {
        self.receiver(dead_letter_path(&subscription_path(&self.name, subscription)))
            .on_message(Arc::new(handler), options)
    }

    /// Receive a single message from `subscription`.
    pub async fn receive(
        &self,
        subscription: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, BatchReceiveError> {
        let mut messages = self.receive_batch(subscription, 1, timeout).await?;
        Ok(messages.pop())
    }

    /// Pull up to `count` messages from `subscription`, settled on the wire.
    pub async fn receive_batch(
        &self,
        subscription: &str,
        count: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BatchReceiveError> {
        self.receiver(subscription_path(&self.name, subscription))
            .receive_batch(count, timeout.unwrap_or(SERVICE_BUS_SERVER_TIMEOUT))
            .await
    }

    fn receiver(&self, path: String) -> Arc<Receiver> {
        self.receivers
            .lock()
            .expect("receiver cache lock poisoned")
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Receiver::new(self.pool.clone(), path)))
            .clone()
    }
}

fn subscription_path(topic: &str, subscription: &str) -> String {
    format!("{topic}/Subscriptions/{subscription}")
}
