

use battenberg::management::{ManagementClient, ManagementError, ManagementEvent};
use battenberg_amqp::amqp::{
    get_application_property, properties_mut, set_application_property, value_message,
    SimpleValue, Value,
};
use battenberg_amqp::transport::Delivery;
use battenberg_amqp::LockToken;
use uuid::Uuid;

use crate::helpers::{wait_until, ManagementScript, TestBroker};

const MANAGEMENT_PATH: &str = "orders/$management";

fn token() -> LockToken {
    LockToken::from_uuid("00112233-4455-6677-8899-aabbccddeeff".parse().unwrap())
}

#[tokio::test]
async fn renew_lock_encodes_the_request_and_succeeds_on_a_2xx_response() {
    // Arrange
    let broker = TestBroker::new();
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();

    // Act
    client.renew_lock(&token()).await.unwrap();

    // Assert: the token went over the wire in its reordered byte layout.
    assert_eq!(broker.renewed_tokens(), vec![token().reordered_bytes()]);

    client.dispose().await;
}

#[tokio::test]
async fn a_non_2xx_response_fails_the_request_with_its_status() {
    let broker = TestBroker::new();
    broker.set_management(ManagementScript {
        status_code: 410,
        ..ManagementScript::default()
    });
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();

    let result = client.renew_lock(&token()).await;

    match result {
        Err(ManagementError::RequestFailure { status, .. }) => assert_eq!(status, Some(410)),
        other => panic!("expected a request failure, got {other:?}"),
    }

    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn a_request_with_no_response_times_out() {
    let broker = TestBroker::new();
    broker.set_management(ManagementScript {
        respond: false,
        ..ManagementScript::default()
    });
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();

    let result = client.renew_lock(&token()).await;

    assert!(matches!(result, Err(ManagementError::RequestTimeout)));

    client.dispose().await;
}

#[tokio::test]
async fn a_response_receiver_detach_terminates_in_flight_requests() {
    // Arrange: requests that never get a response.
    let broker = TestBroker::new();
    broker.set_management(ManagementScript {
        respond: false,
        ..ManagementScript::default()
    });
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();
    let mut events = client.events();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.renew_lock(&token()).await })
    };
    wait_until(|| broker.renewed_tokens().len() == 1).await;

    // Act
    let response_receiver = broker.receiver_on(MANAGEMENT_PATH).unwrap();
    response_receiver.force_detach(None);

    // Assert
    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(ManagementError::RequestTerminated)));

    // When the receiver comes back, the response listener is still the original one and
    // requests flow again.
    response_receiver.force_attach();
    broker.set_management(ManagementScript::default());
    client.renew_lock(&token()).await.unwrap();

    let mut detach_events = 0;
    let mut attach_events = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ManagementEvent::LinkDetached { is_sender, .. } if !is_sender => detach_events += 1,
            ManagementEvent::LinkAttached { is_sender, .. } if !is_sender => attach_events += 1,
            _ => {}
        }
    }
    assert_eq!(detach_events, 1);
    assert_eq!(attach_events, 1);

    client.dispose().await;
}

#[tokio::test]
async fn requests_fail_fast_while_the_pair_is_down() {
    let broker = TestBroker::new();
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();

    broker
        .receiver_on(MANAGEMENT_PATH)
        .unwrap()
        .force_detach(None);

    let result = client.renew_lock(&token()).await;
    match result {
        Err(ManagementError::RequestFailure { status, .. }) => assert_eq!(status, Some(503)),
        other => panic!("expected a synchronous request failure, got {other:?}"),
    }

    client.dispose().await;
}

#[tokio::test]
async fn an_unmatched_response_is_surfaced_as_an_orphan() {
    let broker = TestBroker::new();
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();
    let mut events = client.events();

    let mut stray = value_message(Value::Null);
    properties_mut(&mut stray).correlation_id = Some(
        battenberg_amqp::amqp::MessageId::Uuid(battenberg_amqp::amqp::Uuid::from(
            *Uuid::new_v4().as_bytes(),
        )),
    );
    set_application_property(&mut stray, "statusCode", SimpleValue::Int(200));
    broker
        .receiver_on(MANAGEMENT_PATH)
        .unwrap()
        .push(Delivery {
            message: stray,
            delivery_tag: vec![0u8; 16],
        });

    wait_until(|| {
        matches!(
            events.try_recv(),
            Ok(ManagementEvent::Error(error))
                if matches!(*error, ManagementError::OrphanedResponse { .. })
        )
    })
    .await;

    client.dispose().await;
}

#[tokio::test]
async fn a_response_that_beats_the_send_acknowledgement_still_resolves_the_request() {
    let broker = TestBroker::new();
    broker.set_management(ManagementScript {
        ack_requests: false,
        ..ManagementScript::default()
    });
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();

    client.renew_lock(&token()).await.unwrap();

    client.dispose().await;
}

#[tokio::test]
async fn the_request_carries_the_management_headers() {
    let broker = TestBroker::new();
    broker.set_management(ManagementScript {
        respond: false,
        ..ManagementScript::default()
    });
    let client = ManagementClient::new(&broker.pool(), "orders").await.unwrap();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.renew_lock(&token()).await })
    };
    wait_until(|| broker.renewed_tokens().len() == 1).await;

    // The mock records the request before acking; inspect what went out.
    let request = broker.last_management_request().expect("request recorded");
    assert_eq!(
        get_application_property(&request, "operation"),
        Some(&SimpleValue::String("com.microsoft:renew-lock".to_owned()))
    );
    assert_eq!(
        get_application_property(&request, "com.microsoft:server-timeout"),
        Some(&SimpleValue::Uint(15_000))
    );
    let properties = request.properties.as_ref().unwrap();
    assert!(properties.message_id.is_some());
    let reply_to = properties.reply_to.as_deref().unwrap();
    assert!(reply_to.starts_with("responseReceiver$"));

    broker
        .receiver_on(MANAGEMENT_PATH)
        .unwrap()
        .force_detach(None);
    let _ = in_flight.await.unwrap();
    client.dispose().await;
}
