//! A scripted in-process AMQP engine implementing the `battenberg-amqp` transport
//! contract, so the whole client can be exercised without a broker.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use battenberg_amqp::amqp::{
    body_value, properties_mut, set_application_property, value_message, Accepted, AmqpMessage,
    Outcome, Rejected, SimpleValue, Value,
};
use battenberg_amqp::configuration::ServiceBusSettings;
use battenberg_amqp::transport::{
    AmqpTransport, Connection, ConnectionFactory, CreditPolicy, Delivery, DeliveryStream,
    DetachInfo, LinkEvent, LinkState, ReceiverLink, ReceiverLinkPolicy, ReceiverOptions,
    SenderLink, SenderOptions, Session,
};
use battenberg_amqp::TransportError;
use battenberg_amqp_pool::ConnectionPool;

pub const CONNECTION_STRING: &str =
    "Endpoint=sb://test-ns.servicebus.windows.net/;SharedAccessKeyName=test;SharedAccessKey=secret";

/// How the scripted engine answers data-plane sends.
#[derive(Clone)]
pub enum SendBehavior {
    Accept,
    Reject,
    /// Never settle the transfer.
    Pend,
    Fail(TransportError),
}

/// How the scripted engine answers management requests.
pub struct ManagementScript {
    /// Push a response for each request.
    pub respond: bool,
    /// Status code stamped on responses.
    pub status_code: u32,
    /// Acknowledge the request transfer. When `false` the send never settles, so a
    /// request can only finish through its response.
    pub ack_requests: bool,
}

impl Default for ManagementScript {
    fn default() -> Self {
        Self {
            respond: true,
            status_code: 200,
            ack_requests: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionKind {
    Accept,
    Reject,
    Modify,
    Release,
}

pub struct SentRecord {
    pub target: String,
    pub message: AmqpMessage,
}

#[derive(Default)]
struct BrokerState {
    send_behavior: Option<SendBehavior>,
    management: Option<ManagementScript>,
    sent: Vec<SentRecord>,
    management_requests: Vec<AmqpMessage>,
    /// Raw uuid bytes received in renew-lock requests, in wire order.
    renewed_tokens: Vec<[u8; 16]>,
    sender_links: Vec<Arc<TestSenderLink>>,
    receiver_links: Vec<Arc<TestReceiverLink>>,
}

/// The scripted engine. Cloning shares the underlying state.
#[derive(Clone)]
pub struct TestBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    connections_opened: AtomicUsize,
    state: Mutex<BrokerState>,
}

impl TestBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                connections_opened: AtomicUsize::new(0),
                state: Mutex::new(BrokerState {
                    send_behavior: Some(SendBehavior::Accept),
                    management: Some(ManagementScript::default()),
                    ..BrokerState::default()
                }),
            }),
        }
    }

    pub fn transport(&self) -> Arc<dyn AmqpTransport> {
        Arc::new(TestTransport {
            inner: self.inner.clone(),
        })
    }

    pub fn settings() -> ServiceBusSettings {
        ServiceBusSettings::from_connection_string(CONNECTION_STRING).unwrap()
    }

    pub fn pool(&self) -> ConnectionPool {
        ConnectionPool::new(ConnectionFactory::new(self.transport(), Self::settings()))
    }

    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        self.inner.state.lock().unwrap().send_behavior = Some(behavior);
    }

    pub fn set_management(&self, script: ManagementScript) {
        self.inner.state.lock().unwrap().management = Some(script);
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.inner.state.lock().unwrap().sent.len()
    }

    pub fn sent(&self, index: usize) -> SentRecord {
        let state = self.inner.state.lock().unwrap();
        let record = &state.sent[index];
        SentRecord {
            target: record.target.clone(),
            message: record.message.clone(),
        }
    }

    pub fn renewed_tokens(&self) -> Vec<[u8; 16]> {
        self.inner.state.lock().unwrap().renewed_tokens.clone()
    }

    pub fn last_management_request(&self) -> Option<AmqpMessage> {
        self.inner
            .state
            .lock()
            .unwrap()
            .management_requests
            .last()
            .cloned()
    }

    pub fn sender_links(&self) -> Vec<Arc<TestSenderLink>> {
        self.inner.state.lock().unwrap().sender_links.clone()
    }

    /// The most recently attached receiver link whose source is `path`.
    pub fn receiver_on(&self, path: &str) -> Option<Arc<TestReceiverLink>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .receiver_links
            .iter()
            .rev()
            .find(|link| link.source == path)
            .cloned()
    }

    pub fn receivers_on(&self, path: &str) -> Vec<Arc<TestReceiverLink>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .receiver_links
            .iter()
            .filter(|link| link.source == path)
            .cloned()
            .collect()
    }

    /// Deliver a message on the most recent receiver link for `path`.
    pub fn deliver(&self, path: &str, message: AmqpMessage, delivery_tag: Vec<u8>) {
        let link = self
            .receiver_on(path)
            .expect("no receiver link attached on that path");
        link.push(Delivery {
            message,
            delivery_tag,
        });
    }
}

struct TestTransport {
    inner: Arc<BrokerInner>,
}

#[async_trait::async_trait]
impl AmqpTransport for TestTransport {
    async fn connect(
        &self,
        _settings: &ServiceBusSettings,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestConnection {
            inner: self.inner.clone(),
            open: std::sync::atomic::AtomicBool::new(true),
        }))
    }
}

struct TestConnection {
    inner: Arc<BrokerInner>,
    open: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl Connection for TestConnection {
    async fn create_session(&self) -> Result<Box<dyn Session>, TransportError> {
        Ok(Box::new(TestSession {
            inner: self.inner.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct TestSession {
    inner: Arc<BrokerInner>,
}

#[async_trait::async_trait]
impl Session for TestSession {
    async fn create_sender(
        &self,
        options: SenderOptions,
    ) -> Result<Arc<dyn SenderLink>, TransportError> {
        let link = Arc::new(TestSenderLink {
            broker: self.inner.clone(),
            name: options.name,
            target: options.target,
            state: Mutex::new(LinkState::Attached),
            events: tokio::sync::broadcast::channel(16).0,
        });
        self.inner
            .state
            .lock()
            .unwrap()
            .sender_links
            .push(link.clone());
        Ok(link)
    }

    async fn create_receiver(
        &self,
        options: ReceiverOptions,
    ) -> Result<(Arc<dyn ReceiverLink>, DeliveryStream), TransportError> {
        let (deliveries, stream) = tokio::sync::mpsc::unbounded_channel();
        let initial_credit = match options.policy.credit_policy {
            CreditPolicy::DoNotRefresh => 0,
            _ => options.policy.credit_quantum,
        };
        let link = Arc::new(TestReceiverLink {
            name: options.name,
            source: options.source,
            policy: options.policy,
            state: Mutex::new(LinkState::Attached),
            credit: AtomicU32::new(initial_credit),
            credits_added: Mutex::new(Vec::new()),
            deliveries,
            events: tokio::sync::broadcast::channel(16).0,
            dispositions: Mutex::new(Vec::new()),
        });
        self.inner
            .state
            .lock()
            .unwrap()
            .receiver_links
            .push(link.clone());
        Ok((link, stream))
    }

    async fn end(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct TestSenderLink {
    broker: Arc<BrokerInner>,
    name: String,
    pub target: String,
    state: Mutex<LinkState>,
    events: tokio::sync::broadcast::Sender<LinkEvent>,
}

impl TestSenderLink {
    pub fn force_detach(&self, info: Option<DetachInfo>) {
        *self.state.lock().unwrap() = LinkState::Detached;
        let _ = self.events.send(LinkEvent::Detached(info));
    }

    fn handle_management_request(&self, message: &AmqpMessage) -> Option<()> {
        self.broker
            .state
            .lock()
            .unwrap()
            .management_requests
            .push(message.clone());
        // Record renew-lock tokens (wire order) for assertions.
        if let Some(Value::Map(body)) = body_value(message) {
            if let Some(Value::Array(tokens)) =
                body.get(&Value::String("lock-tokens".to_owned()))
            {
                for token in tokens.0.iter() {
                    if let Value::Uuid(uuid) = token {
                        self.broker
                            .state
                            .lock()
                            .unwrap()
                            .renewed_tokens
                            .push(uuid.clone().into_inner());
                    }
                }
            }
        }

        let (respond, status_code) = {
            let state = self.broker.state.lock().unwrap();
            let script = state.management.as_ref()?;
            (script.respond, script.status_code)
        };
        if !respond {
            return Some(());
        }

        let reply_to = message
            .properties
            .as_ref()
            .and_then(|p| p.reply_to.clone())?;
        let correlation_id = message
            .properties
            .as_ref()
            .and_then(|p| p.message_id.clone())?;

        let mut response = value_message(Value::Null);
        properties_mut(&mut response).correlation_id = Some(correlation_id);
        set_application_property(
            &mut response,
            "statusCode",
            SimpleValue::Int(status_code as i32),
        );

        let state = self.broker.state.lock().unwrap();
        let receiver = state
            .receiver_links
            .iter()
            .rev()
            .find(|link| link.name == reply_to)?;
        receiver.push(Delivery {
            message: response,
            delivery_tag: vec![0u8; 16],
        });
        Some(())
    }
}

#[async_trait::async_trait]
impl SenderLink for TestSenderLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    fn events(&self) -> tokio::sync::broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn send(&self, message: AmqpMessage) -> Result<Outcome, TransportError> {
        if self.target.ends_with("/$management") {
            let ack = {
                let state = self.broker.state.lock().unwrap();
                state
                    .management
                    .as_ref()
                    .map(|script| script.ack_requests)
                    .unwrap_or(true)
            };
            self.handle_management_request(&message);
            if !ack {
                std::future::pending::<()>().await;
            }
            return Ok(Outcome::Accepted(Accepted {}));
        }

        let behavior = {
            let mut state = self.broker.state.lock().unwrap();
            state.sent.push(SentRecord {
                target: self.target.clone(),
                message,
            });
            state.send_behavior.clone().unwrap_or(SendBehavior::Accept)
        };
        match behavior {
            SendBehavior::Accept => Ok(Outcome::Accepted(Accepted {})),
            SendBehavior::Reject => Ok(Outcome::Rejected(Rejected { error: None })),
            SendBehavior::Pend => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            SendBehavior::Fail(error) => Err(error),
        }
    }

    async fn detach(&self) -> Result<(), TransportError> {
        *self.state.lock().unwrap() = LinkState::Detached;
        Ok(())
    }
}

pub struct TestReceiverLink {
    name: String,
    pub source: String,
    pub policy: ReceiverLinkPolicy,
    state: Mutex<LinkState>,
    credit: AtomicU32,
    credits_added: Mutex<Vec<u32>>,
    deliveries: tokio::sync::mpsc::UnboundedSender<Delivery>,
    events: tokio::sync::broadcast::Sender<LinkEvent>,
    dispositions: Mutex<Vec<(DispositionKind, Vec<u8>)>>,
}

impl TestReceiverLink {
    pub fn push(&self, delivery: Delivery) {
        let credit = self.credit.load(Ordering::SeqCst);
        self.credit.store(credit.saturating_sub(1), Ordering::SeqCst);
        let _ = self.deliveries.send(delivery);
    }

    pub fn force_detach(&self, info: Option<DetachInfo>) {
        *self.state.lock().unwrap() = LinkState::Detached;
        let _ = self.events.send(LinkEvent::Detached(info));
    }

    pub fn force_attach(&self) {
        *self.state.lock().unwrap() = LinkState::Attached;
        let _ = self.events.send(LinkEvent::Attached);
    }

    pub fn credits_added(&self) -> Vec<u32> {
        self.credits_added.lock().unwrap().clone()
    }

    pub fn dispositions(&self) -> Vec<(DispositionKind, Vec<u8>)> {
        self.dispositions.lock().unwrap().clone()
    }

    fn record(&self, kind: DispositionKind, delivery: &Delivery) {
        self.dispositions
            .lock()
            .unwrap()
            .push((kind, delivery.delivery_tag.clone()));
    }
}

#[async_trait::async_trait]
impl ReceiverLink for TestReceiverLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    fn credit(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }

    fn events(&self) -> tokio::sync::broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn add_credit(&self, count: u32) -> Result<(), TransportError> {
        self.credit.fetch_add(count, Ordering::SeqCst);
        self.credits_added.lock().unwrap().push(count);
        Ok(())
    }

    async fn accept(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.record(DispositionKind::Accept, delivery);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.record(DispositionKind::Reject, delivery);
        Ok(())
    }

    async fn modify(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.record(DispositionKind::Modify, delivery);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.record(DispositionKind::Release, delivery);
        Ok(())
    }

    async fn detach(&self) -> Result<(), TransportError> {
        *self.state.lock().unwrap() = LinkState::Detached;
        Ok(())
    }
}

/// Build a wire message with a string body.
pub fn wire_message(body: &str) -> AmqpMessage {
    value_message(Value::String(body.to_owned()))
}

/// A 16-byte delivery tag filled with `n`.
pub fn delivery_tag(n: u8) -> Vec<u8> {
    vec![n; 16]
}

/// Poll `predicate` until it holds, yielding between attempts.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition was not reached in time");
}
