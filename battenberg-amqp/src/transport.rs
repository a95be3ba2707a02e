//! The contract for the AMQP 1.0 transport used by the client core.
//!
//! `battenberg` does not speak AMQP framing itself: it drives an engine (connections,
//! sessions, links, flow control) through the traits in this module. The seams are kept
//! object-safe so that the whole client can be exercised against an in-process fake in
//! tests, while production binds a real AMQP 1.0 engine.
//!
//! The hierarchy is [`AmqpTransport`] -> [`Connection`] -> [`Session`] -> link. A receiver
//! link hands inbound transfers to the caller over a [`DeliveryStream`]; both link flavours
//! surface lifecycle changes over a broadcast channel of [`LinkEvent`]s.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::amqp::{AmqpMessage, Outcome};
use crate::configuration::ServiceBusSettings;
use crate::error::TransportError;

/// Default number of credits kept on a receiver link when the transport replenishes the
/// window on its own.
pub const DEFAULT_CREDIT_QUANTUM: u32 = 100;

/// An inbound transfer: the decoded message plus the delivery tag it arrived under.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: AmqpMessage,
    pub delivery_tag: Vec<u8>,
}

/// Stream of inbound transfers for a receiver link.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Attached,
    Detached,
}

/// Link lifecycle notification.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Attached,
    Detached(Option<DetachInfo>),
}

/// What the peer said when it detached a link, if anything.
#[derive(Debug, Clone, Default)]
pub struct DetachInfo {
    pub condition: Option<String>,
    pub description: Option<String>,
}

/// Who settles deliveries on a receiver link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    /// The sender settles before the transfer arrives - delivery is the settlement.
    AutoSettle,
    /// Deliveries stay unsettled until the receiver issues a disposition.
    SettleOnDisposition,
}

/// How the transport replenishes flow credits on a receiver link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditPolicy {
    /// The transport keeps the link topped up with `credit_quantum` credits.
    Auto,
    /// `credit_quantum` credits are granted once on attach; replenishment is the caller's
    /// job via [`ReceiverLink::add_credit`].
    Manual,
    /// No credits are granted at all; every credit is issued explicitly by the caller.
    DoNotRefresh,
}

/// Per-link policy applied when a receiver link is created.
#[derive(Debug, Clone)]
pub struct ReceiverLinkPolicy {
    pub settle_mode: SettleMode,
    pub credit_policy: CreditPolicy,
    pub credit_quantum: u32,
}

impl Default for ReceiverLinkPolicy {
    fn default() -> Self {
        Self {
            settle_mode: SettleMode::AutoSettle,
            credit_policy: CreditPolicy::Auto,
            credit_quantum: DEFAULT_CREDIT_QUANTUM,
        }
    }
}

/// Attach parameters for a sender link.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Link name, unique within the session.
    pub name: String,
    /// The node the link sends to.
    pub target: String,
    /// The source address advertised on attach. Management links set this to the link's own
    /// name; plain senders leave it empty.
    pub source: Option<String>,
}

/// Attach parameters for a receiver link.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Link name, unique within the session.
    pub name: String,
    /// The node the link receives from.
    pub source: String,
    /// The target address advertised on attach. Management links set this to the link's own
    /// name; plain receivers leave it empty.
    pub target: Option<String>,
    pub policy: ReceiverLinkPolicy,
}

/// An AMQP 1.0 engine capable of dialling a namespace.
///
/// The implementation owns everything below the URL: TCP, TLS, SASL and the AMQP
/// connection handshake. Credentials are URL-encoded into the `amqps://` URL by
/// [`ServiceBusSettings::amqp_url`].
#[async_trait::async_trait]
pub trait AmqpTransport: Send + Sync + 'static {
    async fn connect(
        &self,
        settings: &ServiceBusSettings,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An open AMQP connection.
///
/// Connections should be re-used across many links given the initial setup cost; the pool
/// crate takes care of that.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn Session>, TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// An AMQP session: the unit links are created under.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    async fn create_sender(
        &self,
        options: SenderOptions,
    ) -> Result<Arc<dyn SenderLink>, TransportError>;

    /// Create a receiver link.
    ///
    /// Resolves once the link is attached. Inbound transfers are pushed onto the returned
    /// [`DeliveryStream`] in arrival order.
    async fn create_receiver(
        &self,
        options: ReceiverOptions,
    ) -> Result<(Arc<dyn ReceiverLink>, DeliveryStream), TransportError>;

    /// End the session, detaching any links still open under it.
    async fn end(&self) -> Result<(), TransportError>;
}

/// An attached sender link.
#[async_trait::async_trait]
pub trait SenderLink: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> LinkState;

    /// Subscribe to lifecycle events for this link.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Send a message and wait for the peer's disposition.
    async fn send(&self, message: AmqpMessage) -> Result<Outcome, TransportError>;

    async fn detach(&self) -> Result<(), TransportError>;
}

/// An attached receiver link.
#[async_trait::async_trait]
pub trait ReceiverLink: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> LinkState;

    /// The number of unused flow credits currently on the link.
    fn credit(&self) -> u32;

    /// Subscribe to lifecycle events for this link.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Grant the peer `count` additional transfer credits.
    fn add_credit(&self, count: u32) -> Result<(), TransportError>;

    /// Settle a delivery with the `accepted` outcome.
    async fn accept(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Settle a delivery with the `rejected` outcome, dead-lettering it broker-side.
    async fn reject(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Settle a delivery with the `modified` outcome, making it available again.
    async fn modify(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Settle a delivery with the `released` outcome.
    async fn release(&self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn detach(&self) -> Result<(), TransportError>;
}

/// All the information required to open connections to a Service Bus namespace.
///
/// Couples an [`AmqpTransport`] with the namespace settings and applies the configured
/// connection timeout (10 seconds if left unspecified).
#[derive(Clone)]
pub struct ConnectionFactory {
    transport: Arc<dyn AmqpTransport>,
    settings: ServiceBusSettings,
}

impl ConnectionFactory {
    pub fn new(transport: Arc<dyn AmqpTransport>, settings: ServiceBusSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceBusSettings {
        &self.settings
    }

    /// Open a new connection to the namespace.
    #[tracing::instrument(name = "service_bus_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<Arc<dyn Connection>, anyhow::Error> {
        let timeout = self
            .settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        match tokio::time::timeout(timeout, self.transport.connect(&self.settings)).await {
            Ok(result) => {
                Ok(result.map_err(anyhow::Error::from)
                    .map_err(|e| e.context("Failed to connect to Service Bus."))?)
            }
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to connect to Service Bus."
            )),
        }
    }
}
