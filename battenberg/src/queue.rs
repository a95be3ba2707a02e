//! The queue handle: sending, streaming consumption, batch receive, and the dead-letter
//! sub-entity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use battenberg_amqp::transport::LinkEvent;
use battenberg_amqp_pool::ConnectionPool;
use tokio::sync::broadcast;

use crate::constants::{DEAD_LETTER_SUFFIX, DEFAULT_SEND_TIMEOUT, SERVICE_BUS_SERVER_TIMEOUT};
use crate::message::{BrokeredMessage, ReceivedMessage};
use crate::receivers::{
    BatchReceiveError, MessageHandler, MessageListener, OnMessageOptions, Receiver,
};
use crate::senders::{SendError, Sender};

/// A handle to one queue.
///
/// Obtained from [`ServiceBusClient::queue`](crate::ServiceBusClient::queue); composes a
/// lazy [`Sender`] and one receiver per sub-entity (the queue itself and its dead-letter
/// queue).
pub struct QueueClient {
    name: String,
    pool: ConnectionPool,
    sender: Sender,
    receivers: Mutex<HashMap<String, Arc<Receiver>>>,
}

impl QueueClient {
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

    /// Send a message with the default timeout (15 seconds).
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

    /// Whether a send attempted now would find an attached link.
    pub async fn can_send(&self) -> bool {
        self.sender.can_send().await
    }

    /// Tear down the sender's link and lease. The handle remains usable for receiving.
    pub async fn dispose_sender(&self) {
        self.sender.dispose().await
    }

    /// The sender's link lifecycle events (detach/reattach visibility for producers).
    pub fn sender_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.events()
    }

    /// Stream messages from the queue to `handler`.
    pub fn on_message(
        &self,
        handler: impl MessageHandler,
        options: OnMessageOptions,
    ) -> MessageListener {
        self.receiver(self.name.clone())
            .on_message(Arc::new(handler), options)
    }

    /// Stream messages from the queue's dead-letter sub-queue to `handler`.
    pub fn on_dead_lettered_message(
        &self,
        handler: impl MessageHandler,
        options: OnMessageOptions,
    ) -> MessageListener {
        self.receiver(dead_letter_path(&self.name))
            .on_message(Arc::new(handler), options)
    }

    /// Receive a single message, or `None` if nothing arrived before the timeout.
    pub async fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, BatchReceiveError> {
        let mut messages = self.receive_batch(1, timeout).await?;
        Ok(messages.pop())
    }

    /// Pull up to `count` messages, settled on the wire. The default timeout is 60
    /// seconds.
    pub async fn receive_batch(
        &self,
        count: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BatchReceiveError> {
        self.receiver(self.name.clone())
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

pub(crate) fn dead_letter_path(entity_path: &str) -> String {
    format!("{entity_path}/{DEAD_LETTER_SUFFIX}")
}
