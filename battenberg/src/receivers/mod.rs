//! Facilities to pull and process messages from a queue or subscription. Check out
//! [`MessageListener`] and the `on_message`/`receive_batch` operations on the entity
//! handles as starting points.

pub use batch::BatchReceiveError;
pub use credit::{CreditError, CreditManager};
pub use handler::{ClosureHandler, MessageHandler};
pub use streaming::MessageListener;

use std::sync::Arc;

use battenberg_amqp::transport::DetachInfo;
use battenberg_amqp_pool::ConnectionPool;

use crate::constants::{DEFAULT_AUTO_RENEW_TIMEOUT, DEFAULT_MAX_CONCURRENT_CALLS};
use crate::management::ManagementError;
use crate::message::{ReceivedMessage, RenewLockError, SettleError};

pub(crate) mod batch;
pub(crate) mod credit;
mod handler;
pub(crate) mod streaming;

/// How deliveries are settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// The broker holds each message under an exclusive lock until the client settles it or
    /// the lock expires.
    PeekLock,
    /// Delivery is the settlement: the message is gone from the broker the moment it is
    /// put on the wire.
    ReceiveAndDelete,
}

/// Whether (and for how long) the client keeps renewing the lock of an unsettled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAutoRenew {
    /// Never renew.
    Disabled,
    /// Renew until the message has been held for this long, then let the lock lapse.
    For(std::time::Duration),
    /// Renew until the message settles, with no deadline.
    Unbounded,
}

/// Options for a streaming receiver.
#[derive(Debug, Clone)]
pub struct OnMessageOptions {
    pub receive_mode: ReceiveMode,
    /// Settle the message as completed when the handler returns successfully and the
    /// handler itself did not settle it. Default: `true`.
    pub auto_complete: bool,
    /// Lock auto-renewal policy. Default: renew for up to 5 minutes.
    pub lock_auto_renew: LockAutoRenew,
    /// How many handler invocations may be in flight at once. This is enforced through the
    /// link credit window. Default: 1.
    pub max_concurrent_calls: u32,
}

impl Default for OnMessageOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::PeekLock,
            auto_complete: true,
            lock_auto_renew: LockAutoRenew::For(DEFAULT_AUTO_RENEW_TIMEOUT),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

/// Notifications emitted by a [`MessageListener`].
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    /// The receiver link attached (initially, or again after a reattach).
    Attached,
    /// The receiver link detached; a reattach will follow.
    Detached(Option<DetachInfo>),
    /// A management link of the companion control-plane client attached.
    ManagementAttached { name: String, is_sender: bool },
    /// A management link of the companion control-plane client detached.
    ManagementDetached {
        name: String,
        is_sender: bool,
        info: Option<DetachInfo>,
    },
    /// A failure that could not be surfaced to the message handler.
    Error(Arc<ReceiverError>),
}

/// Failures surfaced on the [`MessageListener`] event channel.
#[derive(thiserror::Error, Debug)]
pub enum ReceiverError {
    #[error("the receiver link detached{}", detach_details(.info))]
    Detached { info: Option<DetachInfo> },
    #[error(transparent)]
    Credit(#[from] CreditError),
    #[error(transparent)]
    Settle(#[from] SettleError),
    #[error(transparent)]
    Renewal(#[from] RenewLockError),
    #[error(transparent)]
    Management(#[from] ManagementError),
}

pub(crate) fn detach_details(info: &Option<DetachInfo>) -> String {
    match info {
        Some(info) => format!(
            ": {} - {}",
            info.condition.as_deref().unwrap_or("no condition"),
            info.description.as_deref().unwrap_or("no description"),
        ),
        None => String::new(),
    }
}

/// One receiving endpoint: a queue, a subscription, or a dead-letter sub-entity.
///
/// Entity handles cache one `Receiver` per distinct path; each `on_message` or
/// `receive_batch` call opens its own link through the shared connection pool.
pub(crate) struct Receiver {
    pool: ConnectionPool,
    entity_path: String,
}

impl Receiver {
    pub(crate) fn new(pool: ConnectionPool, entity_path: String) -> Self {
        Self { pool, entity_path }
    }

    /// Start streaming messages to `handler`. See [`MessageListener`].
    pub(crate) fn on_message(
        &self,
        handler: Arc<dyn MessageHandler>,
        options: OnMessageOptions,
    ) -> MessageListener {
        streaming::spawn_listener(
            self.pool.clone(),
            self.entity_path.clone(),
            handler,
            options,
        )
    }

    /// Pull up to `count` messages, settled on the wire, returning early at `timeout`.
    pub(crate) async fn receive_batch(
        &self,
        count: u32,
        timeout: std::time::Duration,
    ) -> Result<Vec<ReceivedMessage>, BatchReceiveError> {
        batch::receive_batch(&self.pool, &self.entity_path, count, timeout).await
    }
}
