use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use battenberg_amqp::amqp::{
    self, get_application_property, properties_mut, set_application_property, value_message,
    AmqpMessage, Array, MessageId, OrderedMap, SimpleValue, Value,
};
use battenberg_amqp::transport::{
    Delivery, DeliveryStream, LinkEvent, LinkState, ReceiverLink, ReceiverLinkPolicy,
    ReceiverOptions, SenderLink, SenderOptions, Session,
};
use battenberg_amqp::LockToken;
use battenberg_amqp_pool::{ConnectionLease, ConnectionPool};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{AMQP_REQUEST_TIMEOUT, MANAGEMENT_SUFFIX};
use crate::management::ManagementError;

const OPERATION_RENEW_LOCK: &str = "com.microsoft:renew-lock";
const SERVER_TIMEOUT_PROPERTY: &str = "com.microsoft:server-timeout";
const TRACKING_ID_PROPERTY: &str = "com.microsoft:tracking-id";

type Responder = oneshot::Sender<Result<ManagementResponse, ManagementError>>;

/// A decoded management response.
#[derive(Debug, Clone)]
pub struct ManagementResponse {
    pub status_code: u32,
    pub error_condition: Option<String>,
    pub tracking_id: Option<String>,
    pub body: Option<Value>,
}

/// Lifecycle notifications for the management link pair.
#[derive(Debug, Clone)]
pub enum ManagementEvent {
    LinkAttached {
        name: String,
        path: String,
        is_sender: bool,
    },
    LinkDetached {
        name: String,
        path: String,
        is_sender: bool,
        info: Option<battenberg_amqp::transport::DetachInfo>,
    },
    /// A failure not attributable to any single request, e.g. an orphaned response.
    Error(Arc<ManagementError>),
}

/// A request/response client over a sender+receiver link pair on `<entity>/$management`.
///
/// Requests are correlated by message id. Each request races its send acknowledgement
/// against the arrival of the response - the broker is entitled to answer before it acks
/// the request transfer - under a fixed per-request timeout. When the response link
/// detaches, every in-flight request is terminated.
pub struct ManagementClient {
    entity_path: String,
    management_path: String,
    sender: Arc<dyn SenderLink>,
    receiver: Arc<dyn ReceiverLink>,
    session: Box<dyn Session>,
    lease: ConnectionLease,
    pending: Mutex<HashMap<Uuid, Responder>>,
    events: broadcast::Sender<ManagementEvent>,
    listener_installed: AtomicBool,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl ManagementClient {
    /// Open the link pair for `entity_path` and start listening for responses.
    #[tracing::instrument(name = "management_client_new", skip(pool))]
    pub async fn new(
        pool: &ConnectionPool,
        entity_path: &str,
    ) -> Result<Arc<Self>, anyhow::Error> {
        let management_path = format!("{entity_path}/{MANAGEMENT_SUFFIX}");
        let lease = pool.lease(2)?;
        let connection = lease.connection().await?;
        let session = connection.create_session().await?;

        let sender_name = format!("requestSender${}", Uuid::new_v4());
        let receiver_name = format!("responseReceiver${}", Uuid::new_v4());

        let sender = session
            .create_sender(SenderOptions {
                name: sender_name.clone(),
                target: management_path.clone(),
                source: Some(sender_name),
            })
            .await?;
        let (receiver, responses) = session
            .create_receiver(ReceiverOptions {
                name: receiver_name.clone(),
                source: management_path.clone(),
                target: Some(receiver_name),
                policy: ReceiverLinkPolicy::default(),
            })
            .await?;

        let (events, _) = broadcast::channel(16);
        let client = Arc::new(Self {
            entity_path: entity_path.to_owned(),
            management_path,
            sender,
            receiver,
            session,
            lease,
            pending: Mutex::new(HashMap::new()),
            events,
            listener_installed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        Self::install_response_listener(&client, responses);
        Self::watch_link_events(&client);
        Ok(client)
    }

    /// Subscribe to link lifecycle notifications and request-client errors.
    pub fn events(&self) -> broadcast::Receiver<ManagementEvent> {
        self.events.subscribe()
    }

    /// Renew the peek lock identified by `token`.
    #[tracing::instrument(name = "renew_lock", skip(self), fields(entity_path = %self.entity_path))]
    pub async fn renew_lock(&self, token: &LockToken) -> Result<(), ManagementError> {
        let mut body = OrderedMap::new();
        body.insert(
            Value::String("lock-tokens".to_owned()),
            Value::Array(Array::from(vec![Value::Uuid(amqp::Uuid::from(
                token.reordered_bytes(),
            ))])),
        );
        let mut request = value_message(Value::Map(body));
        set_application_property(
            &mut request,
            "operation",
            SimpleValue::String(OPERATION_RENEW_LOCK.to_owned()),
        );

        self.send_request(request).await.map(drop)
    }

    /// Issue a request and wait for the correlated response.
    async fn send_request(
        &self,
        mut request: AmqpMessage,
    ) -> Result<ManagementResponse, ManagementError> {
        // Liveness pre-check: fail fast rather than park a request on a dead pair.
        if self.sender.state() != LinkState::Attached
            || self.receiver.state() != LinkState::Attached
        {
            return Err(ManagementError::RequestFailure {
                status: Some(503),
                condition: None,
                tracking_id: None,
                source: None,
            });
        }

        let message_id = Uuid::new_v4();
        {
            let properties = properties_mut(&mut request);
            properties.message_id = Some(MessageId::Uuid(amqp::Uuid::from(
                *message_id.as_bytes(),
            )));
            properties.reply_to = Some(self.receiver.name().to_owned());
        }
        set_application_property(
            &mut request,
            SERVER_TIMEOUT_PROPERTY,
            SimpleValue::Uint(AMQP_REQUEST_TIMEOUT.as_millis() as u32),
        );

        let (responder, mut response) = oneshot::channel();
        self.pending
            .lock()
            .expect("management pending lock poisoned")
            .insert(message_id, responder);

        let outcome = tokio::time::timeout(AMQP_REQUEST_TIMEOUT, async {
            tokio::select! {
                // The broker may answer before the send acknowledgement comes back.
                response = &mut response => Self::unwrap_response(response),
                ack = self.sender.send(request) => match ack {
                    Err(error) => Err(ManagementError::RequestFailure {
                        status: None,
                        condition: None,
                        tracking_id: None,
                        source: Some(error),
                    }),
                    Ok(_) => Self::unwrap_response((&mut response).await),
                },
            }
        })
        .await;

        // Whatever happened - resolved, failed or timed out - the correlation entry goes.
        self.pending
            .lock()
            .expect("management pending lock poisoned")
            .remove(&message_id);

        match outcome {
            Ok(result) => result,
            Err(_) => Err(ManagementError::RequestTimeout),
        }
    }

    fn unwrap_response(
        response: Result<Result<ManagementResponse, ManagementError>, oneshot::error::RecvError>,
    ) -> Result<ManagementResponse, ManagementError> {
        // A dropped responder means the pending map was drained under us.
        response.unwrap_or(Err(ManagementError::RequestTerminated))
    }

    /// Start the task that consumes the response stream. Guarded so that repeated link
    /// attachments never end up with two consumers.
    fn install_response_listener(this: &Arc<Self>, mut responses: DeliveryStream) {
        if this.listener_installed.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = Arc::downgrade(this);
        let shutdown = this.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    delivery = responses.recv() => {
                        let Some(delivery) = delivery else { break };
                        let Some(client) = client.upgrade() else { break };
                        client.handle_response(delivery);
                    }
                }
            }
        });
    }

    fn handle_response(&self, delivery: Delivery) {
        let correlation = delivery
            .message
            .properties
            .as_ref()
            .and_then(|p| p.correlation_id.as_ref())
            .and_then(message_id_to_uuid);

        let Some(correlation) = correlation else {
            self.emit_orphaned(None);
            return;
        };
        let responder = self
            .pending
            .lock()
            .expect("management pending lock poisoned")
            .remove(&correlation);
        let Some(responder) = responder else {
            self.emit_orphaned(Some(correlation.to_string()));
            return;
        };

        let status_code = get_application_property(&delivery.message, "statusCode")
            .and_then(simple_value_to_u32);
        let error_condition = get_application_property(&delivery.message, "errorCondition")
            .and_then(simple_value_to_string);
        let tracking_id = get_application_property(&delivery.message, TRACKING_ID_PROPERTY)
            .and_then(simple_value_to_string);
        let body = amqp::body_value(&delivery.message).cloned();

        let result = match status_code {
            Some(status) if (200..300).contains(&status) => Ok(ManagementResponse {
                status_code: status,
                error_condition,
                tracking_id,
                body,
            }),
            status => Err(ManagementError::RequestFailure {
                status,
                condition: error_condition,
                tracking_id,
                source: None,
            }),
        };
        let _ = responder.send(result);
    }

    fn emit_orphaned(&self, correlation_id: Option<String>) {
        warn!(?correlation_id, "dropping management response with no matching request");
        let _ = self.events.send(ManagementEvent::Error(Arc::new(
            ManagementError::OrphanedResponse { correlation_id },
        )));
    }

    /// Forward link lifecycle events and terminate in-flight requests when the response
    /// link goes away.
    fn watch_link_events(this: &Arc<Self>) {
        for is_sender in [true, false] {
            let mut link_events = if is_sender {
                this.sender.events()
            } else {
                this.receiver.events()
            };
            let name = if is_sender {
                this.sender.name().to_owned()
            } else {
                this.receiver.name().to_owned()
            };
            let path = this.management_path.clone();
            let client = Arc::downgrade(this);
            let shutdown = this.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = link_events.recv() => event,
                    };
                    let Some(client) = client.upgrade() else { break };
                    match event {
                        Ok(LinkEvent::Attached) => {
                            let _ = client.events.send(ManagementEvent::LinkAttached {
                                name: name.clone(),
                                path: path.clone(),
                                is_sender,
                            });
                        }
                        Ok(LinkEvent::Detached(info)) => {
                            let _ = client.events.send(ManagementEvent::LinkDetached {
                                name: name.clone(),
                                path: path.clone(),
                                is_sender,
                                info,
                            });
                            if !is_sender {
                                client.terminate_pending();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    fn terminate_pending(&self) {
        let drained: Vec<Responder> = {
            let mut pending = self
                .pending
                .lock()
                .expect("management pending lock poisoned");
            pending.drain().map(|(_, responder)| responder).collect()
        };
        if !drained.is_empty() {
            debug!(
                entity_path = %self.entity_path,
                count = drained.len(),
                "terminating in-flight management requests"
            );
        }
        for responder in drained {
            let _ = responder.send(Err(ManagementError::RequestTerminated));
        }
    }

    /// Tear the client down: terminate in-flight requests, end the session, release the
    /// connection lease. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.terminate_pending();
        let _ = self.session.end().await;
        self.lease.release();
    }
}

fn message_id_to_uuid(id: &MessageId) -> Option<Uuid> {
    match id {
        MessageId::Uuid(uuid) => Some(Uuid::from_bytes(uuid.clone().into_inner())),
        MessageId::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn simple_value_to_u32(value: &SimpleValue) -> Option<u32> {
    match value {
        SimpleValue::Int(n) => u32::try_from(*n).ok(),
        SimpleValue::Uint(n) => Some(*n),
        SimpleValue::Long(n) => u32::try_from(*n).ok(),
        SimpleValue::Ulong(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

fn simple_value_to_string(value: &SimpleValue) -> Option<String> {
    match value {
        SimpleValue::String(s) => Some(s.clone()),
        SimpleValue::Symbol(s) => Some(s.0.clone()),
        _ => None,
    }
}
