//! The streaming receiver: dispatches deliveries to a user handler under a credit-bounded
//! concurrency window, renews peek locks, settles according to the handler's outcome, and
//! transparently reattaches after a detach.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use battenberg_amqp::transport::{
    Delivery, DeliveryStream, DetachInfo, LinkEvent, ReceiverLink, ReceiverOptions,
};
use battenberg_amqp::LockToken;
use battenberg_amqp_pool::ConnectionPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::constants::{renewal_interval, REATTACH_INTERVAL};
use crate::management::{ManagementClient, ManagementEvent};
use crate::message::{ProcessingState, ReceivedMessage, SettleTasks};
use crate::receivers::{
    CreditManager, LockAutoRenew, MessageHandler, OnMessageOptions, ReceiveMode, ReceiverError,
    ReceiverEvent,
};

/// Handle to a running message subscription.
///
/// Dropping the handle does NOT stop the subscription; call
/// [`dispose`](MessageListener::dispose).
pub struct MessageListener {
    inner: Arc<ListenerInner>,
}

impl MessageListener {
    /// Subscribe to lifecycle and error notifications.
    pub fn events(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the receiver link is currently up and dispatching.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Number of messages whose delayed settlement is still outstanding.
    pub fn pending_settle_count(&self) -> usize {
        self.inner
            .credit
            .lock()
            .expect("listener credit lock poisoned")
            .as_ref()
            .map(|credit| credit.pending_settle_count())
            .unwrap_or(0)
    }

    /// Stop the subscription: cancel renewal timers and delayed settlements, dispose the
    /// management client, end the session, detach the link and release the connection
    /// lease. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.teardown().await;
    }
}

pub(crate) fn spawn_listener(
    pool: ConnectionPool,
    entity_path: String,
    handler: Arc<dyn MessageHandler>,
    options: OnMessageOptions,
) -> MessageListener {
    let (events, _) = broadcast::channel(64);
    let inner = Arc::new(ListenerInner {
        pool,
        entity_path,
        handler,
        options,
        events,
        renewals: StdMutex::new(HashMap::new()),
        settle_tasks: SettleTasks::new(),
        active: tokio::sync::Mutex::new(None),
        credit: StdMutex::new(None),
        listening: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
        disposed: AtomicBool::new(false),
    });
    tokio::spawn(supervise(Arc::clone(&inner)));
    MessageListener { inner }
}

struct ListenerInner {
    pool: ConnectionPool,
    entity_path: String,
    handler: Arc<dyn MessageHandler>,
    options: OnMessageOptions,
    events: broadcast::Sender<ReceiverEvent>,
    renewals: StdMutex<HashMap<LockToken, RenewalEntry>>,
    settle_tasks: Arc<SettleTasks>,
    active: tokio::sync::Mutex<Option<ActiveReceiver>>,
    /// The credit manager of the current link, kept separately for synchronous access.
    credit: StdMutex<Option<Arc<CreditManager>>>,
    listening: AtomicBool,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

struct RenewalEntry {
    /// `None` renews until the message settles.
    deadline: Option<Instant>,
    timer: JoinHandle<()>,
}

struct ActiveReceiver {
    lease: battenberg_amqp_pool::ConnectionLease,
    session: Box<dyn battenberg_amqp::transport::Session>,
    link: Arc<dyn ReceiverLink>,
    management: Arc<ManagementClient>,
    management_forwarder: JoinHandle<()>,
}

/// Everything the delivery pump needs from a successful connect.
struct Connected {
    deliveries: DeliveryStream,
    link_events: broadcast::Receiver<LinkEvent>,
    link: Arc<dyn ReceiverLink>,
    credit: Arc<CreditManager>,
    management: Arc<ManagementClient>,
}

enum PumpExit {
    Disposed,
    Detached(Option<DetachInfo>),
}

/// Connect, pump, reattach - until disposed.
async fn supervise(inner: Arc<ListenerInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match connect(&inner).await {
            Ok(connected) => {
                inner.listening.store(true, Ordering::Release);
                let _ = inner.events.send(ReceiverEvent::Attached);
                let exit = pump(&inner, connected).await;
                inner.listening.store(false, Ordering::Release);
                match exit {
                    PumpExit::Disposed => break,
                    PumpExit::Detached(info) => {
                        let _ = inner.events.send(ReceiverEvent::Detached(info.clone()));
                        inner.emit_error(ReceiverError::Detached { info });
                        inner.teardown().await;
                    }
                }
            }
            Err(error) => {
                debug!(entity_path = %inner.entity_path, error = %format!("{error:#}"), "receiver setup failed");
                inner.emit_error(ReceiverError::Detached {
                    info: Some(DetachInfo {
                        condition: None,
                        description: Some(format!("{error:#}")),
                    }),
                });
                inner.teardown().await;
            }
        }
        // Backoff before reattaching; reconnecting inline would recurse on every failure.
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(REATTACH_INTERVAL) => {}
        }
    }
    inner.teardown().await;
}

#[tracing::instrument(name = "receiver_connect", skip(inner), fields(entity_path = %inner.entity_path))]
async fn connect(inner: &Arc<ListenerInner>) -> Result<Connected, anyhow::Error> {
    let credit = Arc::new(CreditManager::new(
        inner.options.receive_mode,
        inner.options.max_concurrent_calls,
    ));
    let lease = inner.pool.lease(1)?;
    let connection = lease.connection().await?;
    let session = connection.create_session().await?;

    // The data link and the control-plane client come up in parallel.
    let receiver_attach = session.create_receiver(ReceiverOptions {
        name: format!("receiver${}", Uuid::new_v4()),
        source: inner.entity_path.clone(),
        target: None,
        policy: credit.link_policy(),
    });
    let management_attach = ManagementClient::new(&inner.pool, &inner.entity_path);
    let (receiver_result, management_result) = tokio::join!(receiver_attach, management_attach);

    let (link, deliveries) = match receiver_result {
        Ok(receiver) => receiver,
        Err(error) => {
            if let Ok(management) = management_result {
                management.dispose().await;
            }
            let _ = session.end().await;
            return Err(anyhow::Error::from(error).context("Failed to attach the receiver link."));
        }
    };
    let management = match management_result {
        Ok(management) => management,
        Err(error) => {
            let _ = session.end().await;
            return Err(error.context("Failed to build the management client."));
        }
    };

    credit.bind(link.clone());

    let management_forwarder = forward_management_events(inner, &management);
    let link_events = link.events();

    *inner
        .credit
        .lock()
        .expect("listener credit lock poisoned") = Some(credit.clone());
    *inner.active.lock().await = Some(ActiveReceiver {
        lease,
        session,
        link: link.clone(),
        management: management.clone(),
        management_forwarder,
    });

    Ok(Connected {
        deliveries,
        link_events,
        link,
        credit,
        management,
    })
}

/// Dispatch deliveries until the link detaches or the listener is disposed.
async fn pump(inner: &Arc<ListenerInner>, mut connected: Connected) -> PumpExit {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return PumpExit::Disposed,
            event = connected.link_events.recv() => match event {
                Ok(LinkEvent::Attached) => {
                    let _ = inner.events.send(ReceiverEvent::Attached);
                }
                Ok(LinkEvent::Detached(info)) => return PumpExit::Detached(info),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return PumpExit::Detached(None),
            },
            delivery = connected.deliveries.recv() => match delivery {
                Some(delivery) => dispatch(inner, &connected, delivery),
                None => return PumpExit::Detached(None),
            },
        }
    }
}

fn dispatch(inner: &Arc<ListenerInner>, connected: &Connected, delivery: Delivery) {
    // One delivery consumed one credit; let the manager decide whether to top up.
    if let Err(error) = connected.credit.refresh_credits() {
        inner.emit_error(ReceiverError::Credit(error));
    }

    let settled = inner.options.receive_mode != ReceiveMode::PeekLock;
    let message = ReceivedMessage::from_delivery(
        delivery,
        &connected.link,
        Some(&connected.management),
        &connected.credit,
        &inner.settle_tasks,
        settled,
        inner.events.clone(),
    );

    schedule_renewal(inner, &message);

    // The handler runs as its own task: the next delivery is not blocked on it, and the
    // concurrency cap is the credit window.
    let inner = Arc::clone(inner);
    let handler_message = Arc::clone(&message);
    tokio::spawn(async move {
        let succeeded = match inner.handler.handle(Arc::clone(&handler_message)).await {
            Ok(()) => true,
            Err(error) => {
                debug!(error = %format!("{error:#}"), "message handler failed; abandoning the delivery");
                if let Err(settle_error) = handler_message.abandon().await {
                    debug!(%settle_error, "could not abandon after handler failure");
                }
                false
            }
        };
        if succeeded && inner.options.auto_complete && !handler_message.is_settled() {
            if let Err(settle_error) = handler_message.complete().await {
                debug!(%settle_error, "auto-complete could not settle the message");
            }
        }
    });
}

fn forward_management_events(
    inner: &Arc<ListenerInner>,
    management: &Arc<ManagementClient>,
) -> JoinHandle<()> {
    let mut management_events = management.events();
    let events = inner.events.clone();
    tokio::spawn(async move {
        loop {
            match management_events.recv().await {
                Ok(ManagementEvent::LinkAttached {
                    name, is_sender, ..
                }) => {
                    let _ = events.send(ReceiverEvent::ManagementAttached { name, is_sender });
                }
                Ok(ManagementEvent::LinkDetached {
                    name,
                    is_sender,
                    info,
                    ..
                }) => {
                    let _ = events.send(ReceiverEvent::ManagementDetached {
                        name,
                        is_sender,
                        info,
                    });
                }
                Ok(ManagementEvent::Error(error)) => {
                    let _ = events.send(ReceiverEvent::Error(Arc::new(
                        ReceiverError::Management((*error).clone()),
                    )));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Plan the first lock renewal for `message`, or drop its schedule if it is already
/// settled or renewal is off.
fn schedule_renewal(inner: &Arc<ListenerInner>, message: &Arc<ReceivedMessage>) {
    let Some(token) = message.lock_token() else {
        return;
    };
    let deadline = match inner.options.lock_auto_renew {
        LockAutoRenew::Disabled => return,
        LockAutoRenew::Unbounded => None,
        LockAutoRenew::For(window) => {
            // The deadline is fixed at the first schedule for this token.
            let existing = inner
                .renewals
                .lock()
                .expect("renewal lock poisoned")
                .get(&token)
                .and_then(|entry| entry.deadline);
            Some(existing.unwrap_or_else(|| Instant::now() + window))
        }
    };
    arm_renewal_timer(inner, message, token, deadline);
}

fn arm_renewal_timer(
    inner: &Arc<ListenerInner>,
    message: &Arc<ReceivedMessage>,
    token: LockToken,
    deadline: Option<Instant>,
) {
    match message.processing_state() {
        ProcessingState::Settled | ProcessingState::SettleFailed => {
            inner.remove_renewal(token);
            return;
        }
        _ => {}
    }
    let interval = renewal_interval();
    if let Some(deadline) = deadline {
        // A renewal that would complete past the deadline is pointless; stop here.
        if deadline <= Instant::now() + interval {
            inner.remove_renewal(token);
            return;
        }
    }

    let timer = tokio::spawn({
        let inner = Arc::clone(inner);
        let message = Arc::clone(message);
        async move {
            tokio::time::sleep(interval).await;
            match message.processing_state() {
                ProcessingState::Settled | ProcessingState::SettleFailed => {
                    inner.remove_renewal(token);
                    return;
                }
                _ => {}
            }
            match message.renew_lock().await {
                Ok(()) => arm_renewal_timer(&inner, &message, token, deadline),
                Err(error) => {
                    inner.remove_renewal(token);
                    inner.emit_error(ReceiverError::Renewal(error));
                }
            }
        }
    });

    let mut renewals = inner.renewals.lock().expect("renewal lock poisoned");
    if let Some(previous) = renewals.insert(token, RenewalEntry { deadline, timer }) {
        previous.timer.abort();
    }
}

impl ListenerInner {
    fn emit_error(&self, error: ReceiverError) {
        let _ = self.events.send(ReceiverEvent::Error(Arc::new(error)));
    }

    fn remove_renewal(&self, token: LockToken) {
        if let Some(entry) = self
            .renewals
            .lock()
            .expect("renewal lock poisoned")
            .remove(&token)
        {
            entry.timer.abort();
        }
    }

    fn clear_renewals(&self) {
        let mut renewals = self.renewals.lock().expect("renewal lock poisoned");
        for (_, entry) in renewals.drain() {
            entry.timer.abort();
        }
    }

    /// Drop every per-link resource. Also runs between reattach attempts.
    async fn teardown(&self) {
        self.clear_renewals();
        self.settle_tasks.abort_all();
        self.credit
            .lock()
            .expect("listener credit lock poisoned")
            .take();
        if let Some(active) = self.active.lock().await.take() {
            active.management_forwarder.abort();
            active.management.dispose().await;
            let _ = active.session.end().await;
            let _ = active.link.detach().await;
            active.lease.release();
        }
    }
}
