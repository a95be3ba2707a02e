//! The brokered message: the user-visible data carrier, plus the settlement surface of
//! received messages.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use battenberg_amqp::amqp::{
    body_value, get_message_annotation, properties_mut, set_message_annotation,
    system_time_from_timestamp, timestamp_from_system_time, AmqpMessage, ApplicationProperties,
    Header, MessageId, OrderedMap, SimpleValue, Symbol, Value,
};
use battenberg_amqp::transport::{Delivery, LinkState, ReceiverLink};
use battenberg_amqp::{LockToken, TransportError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::management::{ManagementClient, ManagementError};
use crate::receivers::{CreditManager, ReceiverError, ReceiverEvent};

const ANNOTATION_PARTITION_KEY: &str = "x-opt-partition-key";
const ANNOTATION_ENQUEUED_TIME: &str = "x-opt-enqueued-time";
const ANNOTATION_SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
const ANNOTATION_ENQUEUE_SEQUENCE_NUMBER: &str = "x-opt-enqueue-sequence-number";
const ANNOTATION_LOCKED_UNTIL: &str = "x-opt-locked-until";
const ANNOTATION_SCHEDULED_ENQUEUE_TIME: &str = "x-opt-scheduled-enqueue-time";

/// A message to be sent to - or reconstructed from - the broker.
///
/// All fields are optional except the body and the message id; `message_id` defaults to a
/// freshly generated v4 UUID.
#[derive(Debug, Clone)]
pub struct BrokeredMessage {
    /// The payload. Maps, strings, binary - anything expressible as an AMQP value.
    pub body: Value,
    /// Free-form application properties travelling with the message.
    pub properties: OrderedMap<String, SimpleValue>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: String,
    /// The application label (the AMQP `subject`).
    pub label: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub session_id: Option<String>,
    pub scheduled_enqueue_time_utc: Option<SystemTime>,
    pub time_to_live: Option<Duration>,
    pub to: Option<String>,
}

impl BrokeredMessage {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            properties: OrderedMap::new(),
            content_type: None,
            correlation_id: None,
            message_id: Uuid::new_v4().to_string(),
            label: None,
            reply_to: None,
            reply_to_session_id: None,
            partition_key: None,
            session_id: None,
            scheduled_enqueue_time_utc: None,
            time_to_live: None,
            to: None,
        }
    }

    pub fn with_message_id(mut self, value: impl Into<String>) -> Self {
        self.message_id = value.into();
        self
    }

    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    pub fn with_label(mut self, value: impl Into<String>) -> Self {
        self.label = Some(value.into());
        self
    }

    pub fn with_reply_to(mut self, value: impl Into<String>) -> Self {
        self.reply_to = Some(value.into());
        self
    }

    pub fn with_reply_to_session_id(mut self, value: impl Into<String>) -> Self {
        self.reply_to_session_id = Some(value.into());
        self
    }

    pub fn with_partition_key(mut self, value: impl Into<String>) -> Self {
        self.partition_key = Some(value.into());
        self
    }

    pub fn with_session_id(mut self, value: impl Into<String>) -> Self {
        self.session_id = Some(value.into());
        self
    }

    pub fn with_scheduled_enqueue_time_utc(mut self, value: SystemTime) -> Self {
        self.scheduled_enqueue_time_utc = Some(value);
        self
    }

    pub fn with_time_to_live(mut self, value: Duration) -> Self {
        self.time_to_live = Some(value);
        self
    }

    pub fn with_to(mut self, value: impl Into<String>) -> Self {
        self.to = Some(value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<SimpleValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Translate to the wire shape.
    pub(crate) fn to_amqp(&self) -> AmqpMessage {
        let mut message = battenberg_amqp::amqp::value_message(self.body.clone());
        {
            let properties = properties_mut(&mut message);
            properties.message_id = Some(MessageId::String(self.message_id.clone()));
            if let Some(to) = &self.to {
                properties.to = Some(to.clone());
            }
            if let Some(label) = &self.label {
                properties.subject = Some(label.clone());
            }
            if let Some(reply_to) = &self.reply_to {
                properties.reply_to = Some(reply_to.clone());
            }
            if let Some(correlation_id) = &self.correlation_id {
                properties.correlation_id = Some(MessageId::String(correlation_id.clone()));
            }
            if let Some(content_type) = &self.content_type {
                properties.content_type = Some(Symbol::from(content_type.as_str()));
            }
            if let Some(session_id) = &self.session_id {
                properties.group_id = Some(session_id.clone());
            }
            if let Some(reply_to_session_id) = &self.reply_to_session_id {
                properties.reply_to_group_id = Some(reply_to_session_id.clone());
            }
        }
        if let Some(ttl) = self.time_to_live {
            let header = message.header.get_or_insert_with(Header::default);
            header.ttl = Some(ttl.as_millis() as u32);
        }
        if let Some(partition_key) = &self.partition_key {
            set_message_annotation(
                &mut message,
                ANNOTATION_PARTITION_KEY,
                Value::String(partition_key.clone()),
            );
        }
        if let Some(scheduled) = self.scheduled_enqueue_time_utc {
            set_message_annotation(
                &mut message,
                ANNOTATION_SCHEDULED_ENQUEUE_TIME,
                Value::Timestamp(timestamp_from_system_time(scheduled)),
            );
        }
        if !self.properties.is_empty() {
            message.application_properties = Some(ApplicationProperties(self.properties.clone()));
        }
        message
    }

    /// Reconstruct the user-settable fields from the wire shape.
    fn from_amqp(message: &AmqpMessage) -> Self {
        let mut brokered = Self::new(body_value(message).cloned().unwrap_or(Value::Null));

        if let Some(properties) = &message.properties {
            if let Some(id) = properties.message_id.as_ref().and_then(message_id_to_string) {
                brokered.message_id = id;
            }
            brokered.to = properties.to.clone();
            brokered.label = properties.subject.clone();
            brokered.reply_to = properties.reply_to.clone();
            brokered.correlation_id = properties
                .correlation_id
                .as_ref()
                .and_then(message_id_to_string);
            brokered.content_type = properties.content_type.as_ref().map(|s| s.0.clone());
            brokered.session_id = properties.group_id.clone();
            brokered.reply_to_session_id = properties.reply_to_group_id.clone();
        }
        if let Some(header) = &message.header {
            brokered.time_to_live = header.ttl.map(|ms| Duration::from_millis(u64::from(ms)));
        }
        if let Some(Value::String(key)) = get_message_annotation(message, ANNOTATION_PARTITION_KEY)
        {
            brokered.partition_key = Some(key.clone());
        }
        if let Some(Value::Timestamp(ts)) =
            get_message_annotation(message, ANNOTATION_SCHEDULED_ENQUEUE_TIME)
        {
            brokered.scheduled_enqueue_time_utc = Some(system_time_from_timestamp(ts));
        }
        if let Some(application_properties) = &message.application_properties {
            brokered.properties = application_properties.0.clone();
        }
        brokered
    }
}

/// Where a received message is in its settlement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// Received, unsettled.
    Active,
    /// A settlement is scheduled or in flight.
    Settling,
    Settled,
    /// A settlement was attempted and failed; the message is stuck until its lock lapses.
    SettleFailed,
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Settling => "settling",
            Self::Settled => "settled",
            Self::SettleFailed => "settle-failed",
        };
        f.write_str(name)
    }
}

/// Failures settling a received message.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SettleError {
    #[error("the receiver that produced this message is gone; it cannot be settled")]
    CreditManagerGone,
    #[error("the message cannot be settled from the `{0}` state")]
    InvalidState(ProcessingState),
    #[error("the delivery carries no lock token")]
    LockTokenMissing,
    #[error("the receiver link is not attached")]
    LinkDetached,
    #[error("the broker failed the disposition")]
    Disposition(#[source] TransportError),
}

/// Failures renewing a message lock.
#[derive(thiserror::Error, Debug)]
pub enum RenewLockError {
    #[error("the lock renewal request timed out")]
    Timeout,
    #[error("the lock could not be renewed")]
    Failure(#[source] ManagementError),
}

enum SettleOp {
    Complete,
    Abandon,
    DeadLetter,
}

/// A message delivered by the broker.
///
/// Settlement (`complete`/`abandon`/`dead_letter`) is only legal while the message is
/// [`ProcessingState::Active`]; the `*_after` variants schedule the disposition on a timer
/// owned by the receiver. Settlement failures are also emitted on the listener's event
/// channel, so fire-and-forget settling does not lose them.
pub struct ReceivedMessage {
    brokered: BrokeredMessage,
    delivery: Delivery,
    delivery_count: u32,
    sequence_number: Option<i64>,
    enqueued_sequence_number: Option<i64>,
    enqueued_time_utc: Option<SystemTime>,
    locked_until_utc: Option<SystemTime>,
    expires_at_utc: Option<SystemTime>,
    lock_token: Option<LockToken>,
    state: Mutex<ProcessingState>,
    link: Option<Weak<dyn ReceiverLink>>,
    management: Option<Weak<ManagementClient>>,
    credit: Option<Weak<CreditManager>>,
    settle_tasks: Option<Weak<SettleTasks>>,
    events: Option<broadcast::Sender<ReceiverEvent>>,
    /// Self-handle so delayed settlements can move shared ownership into their timer task.
    weak_self: Option<Weak<ReceivedMessage>>,
}

impl Deref for ReceivedMessage {
    type Target = BrokeredMessage;

    fn deref(&self) -> &BrokeredMessage {
        &self.brokered
    }
}

impl ReceivedMessage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_delivery(
        delivery: Delivery,
        link: &Arc<dyn ReceiverLink>,
        management: Option<&Arc<ManagementClient>>,
        credit: &Arc<CreditManager>,
        settle_tasks: &Arc<SettleTasks>,
        initially_settled: bool,
        events: broadcast::Sender<ReceiverEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| {
            let mut message = Self::decode(delivery, initially_settled);
            message.link = Some(Arc::downgrade(link));
            message.management = management.map(Arc::downgrade);
            message.credit = Some(Arc::downgrade(credit));
            message.settle_tasks = Some(Arc::downgrade(settle_tasks));
            message.events = Some(events);
            message.weak_self = Some(weak_self.clone());
            message
        })
    }

    /// A delivery that was settled on the wire (receive-and-delete / batch receive).
    pub(crate) fn pre_settled(delivery: Delivery) -> Self {
        Self::decode(delivery, true)
    }

    fn decode(delivery: Delivery, initially_settled: bool) -> Self {
        let message = &delivery.message;
        let brokered = BrokeredMessage::from_amqp(message);

        let delivery_count = message
            .header
            .as_ref()
            .map(|h| h.delivery_count)
            .unwrap_or(0);
        let sequence_number =
            get_message_annotation(message, ANNOTATION_SEQUENCE_NUMBER).and_then(value_to_i64);
        let enqueued_sequence_number =
            get_message_annotation(message, ANNOTATION_ENQUEUE_SEQUENCE_NUMBER)
                .and_then(value_to_i64);
        let enqueued_time_utc = get_message_annotation(message, ANNOTATION_ENQUEUED_TIME)
            .and_then(value_to_system_time);
        let locked_until_utc = get_message_annotation(message, ANNOTATION_LOCKED_UNTIL)
            .and_then(value_to_system_time);
        let expires_at_utc = message
            .properties
            .as_ref()
            .and_then(|p| p.absolute_expiry_time.as_ref())
            .map(system_time_from_timestamp);
        let lock_token = LockToken::from_delivery_tag(&delivery.delivery_tag);

        Self {
            brokered,
            delivery,
            delivery_count,
            sequence_number,
            enqueued_sequence_number,
            enqueued_time_utc,
            locked_until_utc,
            expires_at_utc,
            lock_token,
            state: Mutex::new(if initially_settled {
                ProcessingState::Settled
            } else {
                ProcessingState::Active
            }),
            link: None,
            management: None,
            credit: None,
            settle_tasks: None,
            events: None,
            weak_self: None,
        }
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn sequence_number(&self) -> Option<i64> {
        self.sequence_number
    }

    pub fn enqueued_sequence_number(&self) -> Option<i64> {
        self.enqueued_sequence_number
    }

    pub fn enqueued_time_utc(&self) -> Option<SystemTime> {
        self.enqueued_time_utc
    }

    pub fn locked_until_utc(&self) -> Option<SystemTime> {
        self.locked_until_utc
    }

    pub fn expires_at_utc(&self) -> Option<SystemTime> {
        self.expires_at_utc
    }

    pub fn lock_token(&self) -> Option<LockToken> {
        self.lock_token
    }

    pub fn processing_state(&self) -> ProcessingState {
        *self.state.lock().expect("message state lock poisoned")
    }

    pub fn is_settled(&self) -> bool {
        self.processing_state() == ProcessingState::Settled
    }

    /// Settle the message as successfully processed.
    pub async fn complete(&self) -> Result<(), SettleError> {
        self.settle(SettleOp::Complete).await
    }

    /// Give the message back to the broker for redelivery.
    pub async fn abandon(&self) -> Result<(), SettleError> {
        self.settle(SettleOp::Abandon).await
    }

    /// Move the message to the entity's dead-letter sub-queue.
    pub async fn dead_letter(&self) -> Result<(), SettleError> {
        self.settle(SettleOp::DeadLetter).await
    }

    /// Schedule [`complete`](Self::complete) to run after `delay`.
    pub fn complete_after(&self, delay: Duration) -> Result<(), SettleError> {
        self.settle_after(SettleOp::Complete, delay)
    }

    /// Schedule [`abandon`](Self::abandon) to run after `delay`.
    pub fn abandon_after(&self, delay: Duration) -> Result<(), SettleError> {
        self.settle_after(SettleOp::Abandon, delay)
    }

    /// Schedule [`dead_letter`](Self::dead_letter) to run after `delay`.
    pub fn dead_letter_after(&self, delay: Duration) -> Result<(), SettleError> {
        self.settle_after(SettleOp::DeadLetter, delay)
    }

    /// Ask the broker to extend this message's peek lock.
    ///
    /// A no-op once the message has settled (or failed to), or when the receiver carried no
    /// management client.
    pub async fn renew_lock(&self) -> Result<(), RenewLockError> {
        match self.processing_state() {
            ProcessingState::Settled | ProcessingState::SettleFailed => return Ok(()),
            _ => {}
        }
        let Some(management) = self.management.as_ref().and_then(Weak::upgrade) else {
            return Ok(());
        };
        let Some(token) = self.lock_token else {
            return Ok(());
        };
        management.renew_lock(&token).await.map_err(|error| match error {
            ManagementError::RequestTimeout => RenewLockError::Timeout,
            other => RenewLockError::Failure(other),
        })
    }

    async fn settle(&self, op: SettleOp) -> Result<(), SettleError> {
        let (credit, token) = self.arm_settlement()?;
        self.perform_disposition(&op, token, credit).await
    }

    fn settle_after(&self, op: SettleOp, delay: Duration) -> Result<(), SettleError> {
        let Some(tasks) = self.settle_tasks.as_ref().and_then(Weak::upgrade) else {
            return Err(SettleError::CreditManagerGone);
        };
        let Some(message) = self.weak_self.as_ref().and_then(Weak::upgrade) else {
            return Err(SettleError::CreditManagerGone);
        };
        let (credit, token) = self.arm_settlement()?;

        // The credit for this delivery is counted now; the disposition later must not
        // count it again.
        credit.schedule_message_settle(token);

        let registry = Arc::downgrade(&tasks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = message.perform_disposition(&op, token, credit).await;
            if let Some(registry) = registry.upgrade() {
                registry.finish(token);
            }
        });
        tasks.insert(token, handle);
        Ok(())
    }

    /// Shared guard chain for every settlement path: resolve the credit manager, require a
    /// lock token, and move `Active` -> `Settling`.
    fn arm_settlement(&self) -> Result<(Arc<CreditManager>, LockToken), SettleError> {
        let credit = self
            .credit
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(SettleError::CreditManagerGone)?;
        let token = self.lock_token.ok_or(SettleError::LockTokenMissing)?;
        let mut state = self.state.lock().expect("message state lock poisoned");
        if *state != ProcessingState::Active {
            return Err(SettleError::InvalidState(*state));
        }
        *state = ProcessingState::Settling;
        Ok((credit, token))
    }

    async fn perform_disposition(
        &self,
        op: &SettleOp,
        token: LockToken,
        credit: Arc<CreditManager>,
    ) -> Result<(), SettleError> {
        let link = self
            .link
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|link| link.state() == LinkState::Attached);

        let result = match link {
            None => Err(SettleError::LinkDetached),
            Some(link) => {
                let disposition = match op {
                    SettleOp::Complete => link.accept(&self.delivery).await,
                    SettleOp::Abandon => link.modify(&self.delivery).await,
                    SettleOp::DeadLetter => link.reject(&self.delivery).await,
                };
                disposition.map_err(SettleError::Disposition)
            }
        };

        // The credit goes back in every outcome.
        credit.settle_message(token);

        {
            let mut state = self.state.lock().expect("message state lock poisoned");
            match &result {
                Ok(()) => *state = ProcessingState::Settled,
                Err(error) => {
                    debug!(%token, %error, "settlement disposition failed");
                    *state = ProcessingState::SettleFailed;
                }
            }
        }
        if let Err(error) = &result {
            self.emit_settle_error(error.clone());
        }
        result
    }

    fn emit_settle_error(&self, error: SettleError) {
        if let Some(events) = &self.events {
            let _ = events.send(ReceiverEvent::Error(Arc::new(ReceiverError::Settle(error))));
        }
    }
}

/// The delayed-settlement tasks of one receiver. Owned by the receiver so that disposing
/// it cancels every outstanding timer deterministically.
pub(crate) struct SettleTasks {
    tasks: Mutex<HashMap<LockToken, JoinHandle<()>>>,
}

impl SettleTasks {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, token: LockToken, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("settle task lock poisoned");
        if let Some(previous) = tasks.insert(token, handle) {
            previous.abort();
        }
    }

    fn finish(&self, token: LockToken) {
        self.tasks
            .lock()
            .expect("settle task lock poisoned")
            .remove(&token);
    }

    pub(crate) fn abort_all(&self) {
        let mut tasks = self.tasks.lock().expect("settle task lock poisoned");
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

fn message_id_to_string(id: &MessageId) -> Option<String> {
    match id {
        MessageId::String(s) => Some(s.clone()),
        MessageId::Uuid(uuid) => Some(Uuid::from_bytes(uuid.clone().into_inner()).to_string()),
        MessageId::Ulong(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Long(n) => Some(*n),
        Value::Int(n) => Some(i64::from(*n)),
        Value::Uint(n) => Some(i64::from(*n)),
        Value::Ulong(n) => i64::try_from(*n).ok(),
        _ => None,
    }
}

fn value_to_system_time(value: &Value) -> Option<SystemTime> {
    match value {
        Value::Timestamp(ts) => Some(system_time_from_timestamp(ts)),
        _ => None,
    }
}
