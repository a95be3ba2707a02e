use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use battenberg_amqp::amqp::Outcome;
use battenberg_amqp::error::{broker_error, BrokerError};
use battenberg_amqp::transport::{
    LinkEvent, LinkState, SenderLink, SenderOptions, Session,
};
use battenberg_amqp::TransportError;
use battenberg_amqp_pool::{ConnectionLease, ConnectionPool};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::message::BrokeredMessage;

/// Error returned when trying to send a message via [`Sender`].
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("the sender has been disposed")]
    Disposed,
    #[error("the send did not settle within {0:?}")]
    Timeout(Duration),
    #[error("the broker rejected the message\n{trace}")]
    Rejected {
        condition: Option<String>,
        description: Option<String>,
        trace: SpanTrace,
    },
    #[error("the broker failed the send\n{1}")]
    Broker(#[source] BrokerError, SpanTrace),
    #[error("transport failure while sending")]
    Transport(#[source] TransportError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A message producer bound to one entity path.
///
/// The underlying link is created lazily on first use and survives across sends; the
/// sender transparently reports the link's `attached`/`detached` transitions on its event
/// channel. `dispose` is idempotent.
pub struct Sender {
    pool: ConnectionPool,
    entity_path: String,
    state: Mutex<Option<OpenSender>>,
    events: broadcast::Sender<LinkEvent>,
    disposed: AtomicBool,
}

struct OpenSender {
    lease: ConnectionLease,
    session: Box<dyn Session>,
    link: Arc<dyn SenderLink>,
    event_forwarder: JoinHandle<()>,
}

impl Sender {
    pub(crate) fn new(pool: ConnectionPool, entity_path: String) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            pool,
            entity_path,
            state: Mutex::new(None),
            events,
            disposed: AtomicBool::new(false),
        }
    }

    /// Subscribe to the underlying link's lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Send `message`, waiting at most `timeout` for the broker's disposition.
    #[tracing::instrument(name = "send_message", skip(self, message), fields(entity_path = %self.entity_path))]
    pub async fn send(
        &self,
        message: &BrokeredMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SendError::Disposed);
        }
        let link = self.ensure().await?;
        let amqp_message = message.to_amqp();

        // Race the transfer's disposition against the caller's deadline; losing the race
        // drops (cancels) the in-flight send.
        let outcome = tokio::time::timeout(timeout, link.send(amqp_message))
            .await
            .map_err(|_| SendError::Timeout(timeout))?;

        match outcome {
            Err(error) => match broker_error(&error) {
                Some(broker) => Err(SendError::Broker(broker, SpanTrace::capture())),
                None => Err(SendError::Transport(error)),
            },
            Ok(Outcome::Rejected(rejected)) => {
                let (condition, description) = match rejected.error {
                    Some(error) => (
                        Some(format!("{:?}", error.condition)),
                        error.description,
                    ),
                    None => (None, None),
                };
                Err(SendError::Rejected {
                    condition,
                    description,
                    trace: SpanTrace::capture(),
                })
            }
            Ok(_) => Ok(()),
        }
    }

    /// Whether a send attempted now would find an attached link.
    ///
    /// Transport failures while checking count as "no".
    pub async fn can_send(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        match self.ensure().await {
            Ok(link) => link.state() == LinkState::Attached,
            Err(_) => false,
        }
    }

    /// Tear down the link, session and connection lease. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(open) = self.state.lock().await.take() {
            open.event_forwarder.abort();
            let _ = open.session.end().await;
            open.lease.release();
        }
    }

    /// Open the link on first use, memoizing it for subsequent sends.
    async fn ensure(&self) -> Result<Arc<dyn SenderLink>, SendError> {
        let mut state = self.state.lock().await;
        if let Some(open) = state.as_ref() {
            return Ok(open.link.clone());
        }

        let lease = self.pool.lease(1).map_err(anyhow::Error::from)?;
        let connection = lease.connection().await.map_err(anyhow::Error::from)?;
        let session = connection
            .create_session()
            .await
            .map_err(|e| anyhow::Error::from(e).context("Failed to open a sender session."))?;
        let link = session
            .create_sender(SenderOptions {
                name: format!("sender${}", Uuid::new_v4()),
                target: self.entity_path.clone(),
                source: None,
            })
            .await
            .map_err(|e| anyhow::Error::from(e).context("Failed to attach the sender link."))?;

        // Re-emit the link's lifecycle on the sender's own channel.
        let mut link_events = link.events();
        let events = self.events.clone();
        let event_forwarder = tokio::spawn(async move {
            loop {
                match link_events.recv().await {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *state = Some(OpenSender {
            lease,
            session,
            link: link.clone(),
            event_forwarder,
        });
        Ok(link)
    }
}
