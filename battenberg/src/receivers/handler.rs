//! The `MessageHandler` trait is how message-processing logic is plugged into a streaming
//! receiver.

use std::future::Future;
use std::sync::Arc;

use crate::message::ReceivedMessage;

/// Implementers of `MessageHandler` process messages delivered by a streaming receiver.
///
/// # Scope
///
/// `handle` does not get access to the underlying AMQP link. With the default options the
/// receiver settles the message according to the outcome of processing: a message the
/// handler neither settled nor failed on is completed, a failing handler gets its message
/// abandoned for redelivery. The handler may also settle explicitly through the message
/// itself - including the delayed variants - in which case the receiver leaves it alone.
///
/// # Implementors
///
/// While you can implement `MessageHandler` for a struct or enum, most of the time you will
/// wrap an async closure in [`ClosureHandler`].
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<ReceivedMessage>) -> Result<(), anyhow::Error>;
}

/// Wrapper type to turn an async closure into a [`MessageHandler`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use battenberg::receivers::ClosureHandler;
/// use battenberg::ReceivedMessage;
///
/// let handler = ClosureHandler(|message: Arc<ReceivedMessage>| async move {
///     let _ = message;
///     Ok::<(), anyhow::Error>(())
/// });
/// # let _ = handler;
/// ```
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for ClosureHandler<F>
where
    F: Fn(Arc<ReceivedMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    async fn handle(&self, message: Arc<ReceivedMessage>) -> Result<(), anyhow::Error> {
        (self.0)(message).await
    }
}

#[async_trait::async_trait]
impl<H> MessageHandler for Box<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, message: Arc<ReceivedMessage>) -> Result<(), anyhow::Error> {
        H::handle(self, message).await
    }
}
