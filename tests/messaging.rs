mod common;

use common::*;
use device_router::broker::memory::MemoryBroker;
use device_router::broker::{BrokerConnection, OutgoingMessage};
use device_router::error::{ConnectionError, ConsumeError, PublishError};
use device_router::routing::EXCHANGE_NAME;
use device_router::{
    Consumer, DeliveryOutcome, Device, DeviceEventHandler, DeviceSelector, RoutingKey,
    TopologyManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_events_reach_only_their_type_queue() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["tv", "air_conditioner"]).await;

    for state in ["on", "off", "standby"] {
        publisher
            .publish_device_event(&Device::new("tv1", "tv", state))
            .await
            .unwrap();
    }

    assert_eq!(broker.ready_count("tv_queue"), Some(3));
    assert_eq!(broker.ready_count("air_conditioner_queue"), Some(0));
}

#[tokio::test]
async fn test_unroutable_is_never_silent() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["tv"]).await;

    let err = publisher
        .publish_device_event(&Device::new("l1", "lights", "on"))
        .await
        .unwrap_err();
    match err {
        PublishError::Unroutable {
            exchange,
            routing_key,
        } => {
            assert_eq!(exchange, EXCHANGE_NAME);
            assert_eq!(routing_key, "device.lights.on");
        }
        other => panic!("expected Unroutable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_round_trip_preserves_state() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["heater"]).await;
    publisher
        .publish_device_event(&Device::new("h1", "heater", "heating"))
        .await
        .unwrap();

    let consumer = Consumer::new(connect(&broker), 1).await.unwrap();
    let mut stream = consumer.subscribe("heater_queue").await.unwrap();
    let delivery = next_delivery(&mut stream).await.unwrap();

    assert_eq!(delivery.routing_key, "device.heater.heating");
    assert_eq!(delivery.content_type.as_deref(), Some("application/json"));
    let device = Device::from_payload(&delivery.body).unwrap();
    assert_eq!(device.state, "heating");
}

#[tokio::test]
async fn test_acked_delivery_does_not_return_on_resubscribe() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["air_conditioner"]).await;
    let device = Device::new("ac1", "air_conditioner", "cooling");
    let key = publisher.publish_device_event(&device).await.unwrap();
    assert_eq!(key.as_str(), "device.air_conditioner.cooling");

    let consumer = Consumer::new(connect(&broker), 1).await.unwrap();
    let mut stream = consumer.subscribe("air_conditioner_queue").await.unwrap();

    let delivery = next_delivery(&mut stream).await.unwrap();
    assert_eq!(delivery.body, device.to_payload().unwrap());
    let handler = RecordingHandler::default();
    let outcome = consumer
        .process("air_conditioner", &delivery, &handler)
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Acknowledged);
    assert!(next_delivery(&mut stream).await.is_none());

    consumer.recover().await.unwrap();
    let mut stream = consumer.subscribe("air_conditioner_queue").await.unwrap();
    assert!(next_delivery(&mut stream).await.is_none());
    assert_eq!(broker.ready_count("air_conditioner_queue"), Some(0));
}

#[tokio::test]
async fn test_failed_delivery_is_redelivered_after_recovery() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["tv"]).await;
    publisher
        .publish_device_event(&Device::new("tv1", "tv", "on"))
        .await
        .unwrap();

    let consumer = Consumer::new(connect(&broker), 1).await.unwrap();
    let mut stream = consumer.subscribe("tv_queue").await.unwrap();
    let delivery = next_delivery(&mut stream).await.unwrap();
    assert!(!delivery.redelivered);

    let handler = RecordingHandler::failing_on(&[delivery.body.as_ref()]);
    let outcome = consumer.process("tv", &delivery, &handler).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::LeftUnacknowledged);
    assert_eq!(broker.unacked_count("tv_queue"), 1);

    consumer.recover().await.unwrap();
    assert_eq!(broker.unacked_count("tv_queue"), 0);

    let mut stream = consumer.subscribe("tv_queue").await.unwrap();
    let redelivered = next_delivery(&mut stream).await.unwrap();
    assert!(redelivered.redelivered);
    assert_eq!(redelivered.body, delivery.body);
}

#[tokio::test]
async fn test_prefetch_one_holds_second_delivery() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["lights"]).await;
    for state in ["on", "off"] {
        publisher
            .publish_device_event(&Device::new("l1", "lights", state))
            .await
            .unwrap();
    }

    let consumer = Consumer::new(connect(&broker), 1).await.unwrap();
    let mut stream = consumer.subscribe("lights_queue").await.unwrap();

    let first = next_delivery(&mut stream).await.unwrap();
    assert!(next_delivery(&mut stream).await.is_none());
    assert_eq!(broker.ready_count("lights_queue"), Some(1));

    first.ack().await.unwrap();
    let second = next_delivery(&mut stream).await.unwrap();
    assert_eq!(Device::from_payload(&second.body).unwrap().state, "off");
}

#[tokio::test]
async fn test_redeclaring_topology_is_idempotent() {
    let broker = MemoryBroker::new();
    let channel = open_channel(&broker).await;
    let topology = TopologyManager::new(channel);
    let selector = DeviceSelector::for_type("tv");

    let first = topology.ensure_device_queue(&selector).await.unwrap();
    let second = topology.ensure_device_queue(&selector).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(broker.binding_count("tv_queue"), 1);
}

#[tokio::test]
async fn test_broad_selector_receives_every_type() {
    let broker = MemoryBroker::new();
    let channel = open_channel(&broker).await;
    let queue = TopologyManager::new(Arc::clone(&channel))
        .ensure_device_queue(&DeviceSelector::new(None, Some("on".to_string())))
        .await
        .unwrap();
    assert_eq!(queue.name, "all_devices_queue");

    let publisher = device_router::Publisher::new(channel, CONFIRM_TIMEOUT);
    publisher
        .publish_device_event(&Device::new("tv1", "tv", "on"))
        .await
        .unwrap();
    publisher
        .publish_device_event(&Device::new("l1", "lights", "on"))
        .await
        .unwrap();
    let err = publisher
        .publish_device_event(&Device::new("l1", "lights", "off"))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Unroutable { .. }));
    assert_eq!(broker.ready_count("all_devices_queue"), Some(2));
}

#[tokio::test]
async fn test_confirm_wait_is_bounded() {
    let broker = MemoryBroker::new();
    let channel = open_channel(&broker).await;
    TopologyManager::new(Arc::clone(&channel))
        .ensure_device_queue(&DeviceSelector::for_type("tv"))
        .await
        .unwrap();
    let publisher = device_router::Publisher::new(channel, Duration::from_millis(50));
    broker.hold_confirms(true);

    let err = publisher
        .publish_device_event(&Device::new("tv1", "tv", "on"))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::ConfirmTimeout(_)));
}

#[tokio::test]
async fn test_closing_channel_fails_inflight_confirm() {
    let broker = MemoryBroker::new();
    let channel = open_channel(&broker).await;
    TopologyManager::new(Arc::clone(&channel))
        .ensure_device_queue(&DeviceSelector::for_type("tv"))
        .await
        .unwrap();
    let publisher = device_router::Publisher::new(Arc::clone(&channel), Duration::from_secs(5));
    broker.hold_confirms(true);

    let key = RoutingKey::for_device("tv", "on").unwrap();
    let (result, _) = tokio::join!(
        publisher.send(EXCHANGE_NAME, &key, OutgoingMessage::text("on")),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            channel.close().await.unwrap();
        }
    );
    assert!(matches!(result, Err(PublishError::ConnectionLost(_))));

    // Further publishes on the closed channel fail the same way
    let err = publisher
        .send(EXCHANGE_NAME, &key, OutgoingMessage::text("on"))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::ConnectionLost(_)));
}

#[tokio::test]
async fn test_consumer_loop_survives_handler_failures() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["tv"]).await;
    for state in ["broken", "on", "off"] {
        publisher
            .publish_device_event(&Device::new("tv1", "tv", state))
            .await
            .unwrap();
    }
    let failing = Device::new("tv1", "tv", "broken").to_payload().unwrap();

    let consumer = Arc::new(Consumer::new(connect(&broker), 10).await.unwrap());
    let handler = Arc::new(RecordingHandler::failing_on(&[failing.as_ref()]));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let consumer = Arc::clone(&consumer);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { consumer.run("tv_queue", "tv", handler, shutdown_rx).await })
    };

    wait_until(|| handler.seen_count() == 3).await;
    shutdown_tx.send(true).unwrap();
    let stats = task.await.unwrap().unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(broker.unacked_count("tv_queue"), 1);
    assert!(handler.seen.lock().iter().all(|(t, _)| t == "tv"));
}

#[tokio::test]
async fn test_prefetch_one_consumer_recovers_from_transient_failure() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, &["tv"]).await;
    for state in ["broken", "on", "off"] {
        publisher
            .publish_device_event(&Device::new("tv1", "tv", state))
            .await
            .unwrap();
    }
    let payload = |state: &str| Device::new("tv1", "tv", state).to_payload().unwrap().to_vec();

    let consumer = Arc::new(
        Consumer::new(connect(&broker), 1)
            .await
            .unwrap()
            .with_recovery_delay(Duration::from_millis(10)),
    );
    let handler = Arc::new(RecordingHandler::failing_once_on(&[payload("broken").as_slice()]));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let consumer = Arc::clone(&consumer);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { consumer.run("tv_queue", "tv", handler, shutdown_rx).await })
    };

    wait_until(|| handler.seen_count() == 4).await;
    wait_until(|| broker.unacked_count("tv_queue") == 0).await;
    shutdown_tx.send(true).unwrap();
    let stats = task.await.unwrap().unwrap();

    // The failed event comes back first, ahead of the ones behind it
    let order: Vec<Vec<u8>> = handler.seen.lock().iter().map(|(_, p)| p.clone()).collect();
    assert_eq!(
        order,
        vec![payload("broken"), payload("broken"), payload("on"), payload("off")]
    );
    assert_eq!(stats.received, 4);
    assert_eq!(stats.acknowledged, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.recoveries, 1);
    assert_eq!(broker.ready_count("tv_queue"), Some(0));
}

#[tokio::test]
async fn test_consumer_loop_ends_when_connection_drops() {
    let broker = MemoryBroker::new();
    publisher_for(&broker, &["tv"]).await;

    let consumer = Consumer::new(connect(&broker), 1).await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (result, _) = tokio::join!(
        consumer.run("tv_queue", "tv", Arc::new(DeviceEventHandler), shutdown_rx),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            broker.sever_connections();
        }
    );
    assert!(matches!(result, Err(ConsumeError::StreamClosed)));
}

#[tokio::test]
async fn test_subscribing_to_missing_queue_fails() {
    let broker = MemoryBroker::new();
    let consumer = Consumer::new(connect(&broker), 1).await.unwrap();
    assert!(matches!(
        consumer.subscribe("ghost_queue").await,
        Err(ConsumeError::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn test_connection_failures_are_typed() {
    let broker = MemoryBroker::with_credentials("kay", "secret", "customers");

    assert!(matches!(
        broker.connect("kay", "wrong", "customers"),
        Err(ConnectionError::AccessRefused(_))
    ));
    assert!(matches!(
        broker.connect("kay", "secret", "other"),
        Err(ConnectionError::VhostNotFound(_))
    ));

    broker.set_reachable(false);
    assert!(matches!(
        broker.connect("kay", "secret", "customers"),
        Err(ConnectionError::Unreachable { .. })
    ));

    broker.set_reachable(true);
    let connection = broker.connect("kay", "secret", "customers").unwrap();
    assert!(connection.is_open());
}
