use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use battenberg::{
    BrokeredMessage, ClosureHandler, LockAutoRenew, OnMessageOptions, ReceiveMode, ReceivedMessage,
    ReceiverEvent, ServiceBusClient,
};
use battenberg_amqp::amqp::Value;
use battenberg_amqp::transport::{CreditPolicy, ReceiverLink, SettleMode};
use battenberg_amqp::LockToken;

use crate::helpers::{delivery_tag, wait_until, DispositionKind, TestBroker, CONNECTION_STRING};

fn client(broker: &TestBroker) -> ServiceBusClient {
    ServiceBusClient::from_connection_string(CONNECTION_STRING, broker.transport()).unwrap()
}

fn wire(body: &str) -> battenberg_amqp::amqp::AmqpMessage {
    crate::helpers::wire_message(body)
}

#[tokio::test]
async fn a_successful_handler_auto_completes_the_message() {
    // Arrange
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_handler = handled.clone();

    let listener = queue.on_message(
        ClosureHandler(move |message: Arc<ReceivedMessage>| {
            let handled = handled_in_handler.clone();
            async move {
                assert!(!message.is_settled());
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        OnMessageOptions::default(),
    );
    wait_until(|| listener.is_listening()).await;

    // Act
    broker.deliver("orders", wire("one"), delivery_tag(1));
    let link = broker.receiver_on("orders").unwrap();
    wait_until(|| !link.dispositions().is_empty()).await;

    // Assert
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(
        link.dispositions(),
        vec![(DispositionKind::Accept, delivery_tag(1))]
    );
    // Exactly one credit came back for the delivery.
    assert_eq!(link.credits_added(), vec![1]);

    listener.dispose().await;
}

#[tokio::test]
async fn a_failing_handler_abandons_the_message_instead_of_completing_it() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Err(anyhow::anyhow!("processing failed")) }),
        OnMessageOptions::default(),
    );
    wait_until(|| listener.is_listening()).await;

    broker.deliver("orders", wire("one"), delivery_tag(2));
    let link = broker.receiver_on("orders").unwrap();
    wait_until(|| !link.dispositions().is_empty()).await;

    assert_eq!(
        link.dispositions(),
        vec![(DispositionKind::Modify, delivery_tag(2))]
    );
    assert_eq!(link.credits_added(), vec![1]);

    listener.dispose().await;
}

#[tokio::test]
async fn receive_and_delete_deliveries_arrive_pre_settled() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");
    let observed_settled = Arc::new(AtomicUsize::new(0));
    let observed = observed_settled.clone();

    let listener = queue.on_message(
        ClosureHandler(move |message: Arc<ReceivedMessage>| {
            let observed = observed.clone();
            async move {
                if message.is_settled() {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }),
        OnMessageOptions {
            receive_mode: ReceiveMode::ReceiveAndDelete,
            ..OnMessageOptions::default()
        },
    );
    wait_until(|| listener.is_listening()).await;

    let link = broker.receiver_on("orders").unwrap();
    // The pass-through policy: auto-settled wire deliveries, library default credits.
    assert_eq!(link.policy.settle_mode, SettleMode::AutoSettle);
    assert_eq!(link.policy.credit_policy, CreditPolicy::Auto);

    broker.deliver("orders", wire("one"), delivery_tag(3));
    wait_until(|| observed_settled.load(Ordering::SeqCst) == 1).await;

    // Nothing to settle: no disposition goes out.
    assert!(link.dispositions().is_empty());

    listener.dispose().await;
}

#[tokio::test]
async fn the_credit_window_is_sized_to_the_concurrency_cap() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Ok(()) }),
        OnMessageOptions {
            max_concurrent_calls: 4,
            ..OnMessageOptions::default()
        },
    );
    wait_until(|| listener.is_listening()).await;

    let link = broker.receiver_on("orders").unwrap();
    assert_eq!(link.policy.credit_quantum, 4);
    assert_eq!(link.policy.settle_mode, SettleMode::SettleOnDisposition);
    assert_eq!(link.credit(), 4);

    for n in 0..4 {
        broker.deliver("orders", wire("m"), delivery_tag(n));
    }
    wait_until(|| link.dispositions().len() == 4).await;

    // Refreshes only run below the threshold (ceil(4 / 2) = 2): the first two settles
    // top the window up one by one, the later ones accrue.
    assert_eq!(link.credits_added(), vec![1, 1]);

    listener.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn locks_are_renewed_on_the_renewal_cadence_until_the_deadline() {
    // Renew window of 60s with a 22.5s cadence: renewals land at 22.5s and 45s; a third
    // at 67.5s would overshoot the deadline and is never scheduled.
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Ok(()) }),
        OnMessageOptions {
            auto_complete: false,
            lock_auto_renew: LockAutoRenew::For(Duration::from_secs(60)),
            ..OnMessageOptions::default()
        },
    );
    wait_until(|| listener.is_listening()).await;

    broker.deliver("orders", wire("slow"), delivery_tag(9));
    tokio::task::yield_now().await;
    assert_eq!(broker.renewed_tokens().len(), 0);

    tokio::time::sleep(Duration::from_secs(23)).await;
    assert_eq!(broker.renewed_tokens().len(), 1);

    tokio::time::sleep(Duration::from_secs(23)).await;
    assert_eq!(broker.renewed_tokens().len(), 2);

    tokio::time::sleep(Duration::from_secs(23)).await;
    assert_eq!(broker.renewed_tokens().len(), 2);

    // The broker received the token in its wire byte order.
    let expected = LockToken::from_delivery_tag(&delivery_tag(9))
        .unwrap()
        .reordered_bytes();
    assert_eq!(broker.renewed_tokens()[0], expected);

    listener.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_auto_renew_never_renews() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Ok(()) }),
        OnMessageOptions {
            auto_complete: false,
            lock_auto_renew: LockAutoRenew::Disabled,
            ..OnMessageOptions::default()
        },
    );
    wait_until(|| listener.is_listening()).await;

    broker.deliver("orders", wire("slow"), delivery_tag(9));
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(broker.renewed_tokens().is_empty());

    listener.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn unbounded_auto_renew_keeps_renewing_until_settlement() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Ok(()) }),
        OnMessageOptions {
            auto_complete: false,
            lock_auto_renew: LockAutoRenew::Unbounded,
            ..OnMessageOptions::default()
        },
    );
    wait_until(|| listener.is_listening()).await;

    broker.deliver("orders", wire("slow"), delivery_tag(7));
    tokio::time::sleep(Duration::from_secs(120)).await;

    // 22.5s cadence: renewals at 22.5, 45, 67.5, 90 and 112.5.
    assert_eq!(broker.renewed_tokens().len(), 5);

    listener.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn a_delayed_abandon_keeps_the_message_settling_until_the_timer_fires() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(move |message: Arc<ReceivedMessage>| async move {
            message.abandon_after(Duration::from_secs(5)).unwrap();
            Ok(())
        }),
        OnMessageOptions {
            lock_auto_renew: LockAutoRenew::Disabled,
            ..OnMessageOptions::default()
        },
    );
    wait_until(|| listener.is_listening()).await;

    broker.deliver("orders", wire("later"), delivery_tag(4));
    let link = broker.receiver_on("orders").unwrap();
    wait_until(|| listener.pending_settle_count() == 1).await;

    // The credit was already accounted for at scheduling time.
    assert_eq!(link.credits_added(), vec![1]);
    assert!(link.dispositions().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_until(|| !link.dispositions().is_empty()).await;

    assert_eq!(
        link.dispositions(),
        vec![(DispositionKind::Modify, delivery_tag(4))]
    );
    // No second credit for the actual disposition.
    assert_eq!(link.credits_added(), vec![1]);
    assert_eq!(listener.pending_settle_count(), 0);

    listener.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn a_detached_link_is_reattached_after_the_backoff() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Ok(()) }),
        OnMessageOptions::default(),
    );
    let mut events = listener.events();
    wait_until(|| listener.is_listening()).await;

    broker
        .receiver_on("orders")
        .unwrap()
        .force_detach(Some(battenberg_amqp::transport::DetachInfo {
            condition: Some("amqp:link:detach-forced".to_owned()),
            description: None,
        }));
    wait_until(|| !listener.is_listening()).await;

    // Reattach happens only after the backoff.
    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_until(|| listener.is_listening()).await;
    assert_eq!(broker.receivers_on("orders").len(), 2);

    // The listener surfaced the detach, an error, and the new attach.
    let mut saw_detached = false;
    let mut saw_error = false;
    let mut saw_reattach = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ReceiverEvent::Detached(_) => saw_detached = true,
            ReceiverEvent::Error(_) => saw_error = true,
            ReceiverEvent::Attached if saw_detached => saw_reattach = true,
            _ => {}
        }
    }
    assert!(saw_detached && saw_error && saw_reattach);

    // The fresh link still dispatches.
    broker.deliver("orders", wire("after"), delivery_tag(8));
    let link = broker.receiver_on("orders").unwrap();
    wait_until(|| !link.dispositions().is_empty()).await;

    listener.dispose().await;
}

#[tokio::test]
async fn one_connection_carries_the_sender_and_the_receiver_links() {
    let broker = TestBroker::new();
    let client = client(&broker);
    let queue = client.queue("orders");

    queue
        .send(&BrokeredMessage::new(Value::Null))
        .await
        .unwrap();
    let listener = queue.on_message(
        ClosureHandler(|_message| async move { Ok(()) }),
        OnMessageOptions::default(),
    );
    wait_until(|| listener.is_listening()).await;

    // Sender (1 link), receiver (1) and the management pair (2) all fit one connection.
    assert_eq!(broker.connections_opened(), 1);

    listener.dispose().await;
}
