//! Broadcast publish/consume tests against the in-memory broker.
//!
//! Run with: cargo test --test broadcast

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{assert_silent, drain, recv};
use hmq_events::broker::BrokerConnection;
use hmq_events::envelope::{Envelope, JSON_CONTENT_TYPE};
use hmq_events::{
    Consumer, ConsumerOptions, EventsError, ExchangeOptions, InMemoryBroker, Publisher,
    QueueOptions,
};
use serde_json::{json, Value};

const NAMESPACE: &str = "test-events";
const EXCHANGE: &str = "test-events-events-exchange";

async fn connected_publisher(broker: &InMemoryBroker) -> Publisher {
    let mut publisher = Publisher::new(NAMESPACE).unwrap();
    publisher.connect(broker.connect()).await.unwrap();
    publisher
}

async fn connected_consumer(broker: &InMemoryBroker, options: ConsumerOptions) -> Consumer {
    let mut consumer = Consumer::new(options).unwrap();
    consumer.connect(broker.connect()).await.unwrap();
    consumer
}

fn property(value: &str) -> Value {
    json!({ "property": value })
}

#[tokio::test]
async fn test_consumer_receives_only_subscribed_events() {
    let broker = InMemoryBroker::new();
    let mut consumer =
        Consumer::new(ConsumerOptions::new(NAMESPACE, ["event-2", "event-3"])).unwrap();
    let mut event_1 = consumer.subscribe("event-1");
    let mut event_2 = consumer.subscribe("event-2");
    consumer.connect(broker.connect()).await.unwrap();
    let publisher = connected_publisher(&broker).await;

    publisher
        .publish("event-1", &property("event-1-value"))
        .await
        .unwrap();
    publisher
        .publish("event-2", &property("event-2-value"))
        .await
        .unwrap();

    assert_eq!(recv(&mut event_2).await, property("event-2-value"));
    assert_silent(&mut event_1).await;
    assert_silent(&mut event_2).await;
}

#[tokio::test]
async fn test_publish_reaches_every_subscribed_consumer() {
    let broker = InMemoryBroker::new();

    let consumer_1 = connected_consumer(
        &broker,
        ConsumerOptions::new(NAMESPACE, ["event-1", "event-2", "event-3"]),
    )
    .await;
    let consumer_2 =
        connected_consumer(&broker, ConsumerOptions::new(NAMESPACE, ["event-2", "event-3"])).await;
    let consumer_3 = connected_consumer(&broker, ConsumerOptions::new(NAMESPACE, ["event-3"])).await;

    let events = ["event-1", "event-2", "event-3"];
    let mut receivers: Vec<Vec<_>> = [&consumer_1, &consumer_2, &consumer_3]
        .iter()
        .map(|consumer| events.iter().map(|e| consumer.subscribe(*e)).collect())
        .collect();

    let publisher = connected_publisher(&broker).await;
    for event in events {
        publisher
            .publish(event, &property(&format!("{}-value", event)))
            .await
            .unwrap();
    }

    // consumer -> events it must see
    let expected: [&[&str]; 3] = [
        &["event-1", "event-2", "event-3"],
        &["event-2", "event-3"],
        &["event-3"],
    ];
    for (consumer_rx, wanted) in receivers.iter_mut().zip(expected) {
        for (event, rx) in events.iter().zip(consumer_rx.iter_mut()) {
            let received = drain(rx).await;
            if wanted.contains(event) {
                assert_eq!(received, vec![property(&format!("{}-value", event))]);
            } else {
                assert!(received.is_empty(), "{} should not be delivered", event);
            }
        }
    }
}

#[tokio::test]
async fn test_distinct_app_ids_each_receive_every_event() {
    let broker = InMemoryBroker::new();
    let billing = connected_consumer(
        &broker,
        ConsumerOptions::new(NAMESPACE, ["order-placed"]).with_app_id("billing"),
    )
    .await;
    let shipping = connected_consumer(
        &broker,
        ConsumerOptions::new(NAMESPACE, ["order-placed"]).with_app_id("shipping"),
    )
    .await;
    let mut billing_rx = billing.subscribe("order-placed");
    let mut shipping_rx = shipping.subscribe("order-placed");

    let publisher = connected_publisher(&broker).await;
    for id in 0..5 {
        publisher
            .publish("order-placed", &json!({ "id": id }))
            .await
            .unwrap();
    }

    let expected: Vec<Value> = (0..5).map(|id| json!({ "id": id })).collect();
    assert_eq!(drain(&mut billing_rx).await, expected);
    assert_eq!(drain(&mut shipping_rx).await, expected);
    assert_eq!(
        broker.queue_names(),
        vec![
            "order-placed-events-queue-billing",
            "order-placed-events-queue-shipping"
        ]
    );
}

#[tokio::test]
async fn test_shared_app_id_on_one_connection_load_balances() {
    let broker = InMemoryBroker::new();
    let connection = broker.connect();
    let options = ConsumerOptions::new(NAMESPACE, ["job-queued"]).with_app_id("workers");

    let mut first = Consumer::new(options.clone()).unwrap();
    let mut second = Consumer::new(options).unwrap();
    let first_count = Arc::new(AtomicUsize::new(0));
    let second_count = Arc::new(AtomicUsize::new(0));
    let counter = first_count.clone();
    first.on("job-queued", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = second_count.clone();
    second.on("job-queued", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    first.connect(connection.clone()).await.unwrap();
    second.connect(connection.clone()).await.unwrap();
    assert_eq!(broker.consumer_count("job-queued-events-queue-workers"), 2);

    let publisher = connected_publisher(&broker).await;
    for job in 0..10 {
        publisher
            .publish("job-queued", &json!({ "job": job }))
            .await
            .unwrap();
    }

    tokio::time::timeout(common::RECEIVE_TIMEOUT, async {
        while first_count.load(Ordering::SeqCst) + second_count.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timed out waiting for jobs");

    assert_eq!(first_count.load(Ordering::SeqCst), 5);
    assert_eq!(second_count.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_shared_app_id_across_connections_is_locked() {
    let broker = InMemoryBroker::new();
    let options = ConsumerOptions::new(NAMESPACE, ["job-queued"]).with_app_id("workers");
    let _owner = connected_consumer(&broker, options.clone()).await;

    let mut intruder = Consumer::new(options).unwrap();
    let result = intruder.connect(broker.connect()).await;

    match result {
        Err(EventsError::Broker(message)) => assert!(message.contains("RESOURCE_LOCKED")),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    assert!(!intruder.is_connected());
}

#[tokio::test]
async fn test_payloads_arrive_unchanged() {
    let broker = InMemoryBroker::new();
    let consumer = connected_consumer(&broker, ConsumerOptions::new(NAMESPACE, ["payload"])).await;
    let mut rx = consumer.subscribe("payload");
    let publisher = connected_publisher(&broker).await;

    let payloads = vec![
        json!({
            "user": { "id": 42, "name": "Ada", "tags": ["admin", "ops"] },
            "active": true,
            "score": 99.5,
            "manager": null
        }),
        json!([1, "two", { "three": 3 }]),
        json!("plain string"),
        json!(7),
        json!(false),
    ];
    for payload in &payloads {
        publisher.publish("payload", payload).await.unwrap();
    }

    for payload in payloads {
        assert_eq!(recv(&mut rx).await, payload);
    }
}

#[tokio::test]
async fn test_bad_messages_do_not_block_other_events() {
    let broker = InMemoryBroker::new();
    let consumer = connected_consumer(
        &broker,
        ConsumerOptions::new(NAMESPACE, ["event-a", "event-b"]).with_app_id("app"),
    )
    .await;
    let mut event_a = consumer.subscribe("event-a");
    let mut event_b = consumer.subscribe("event-b");
    let publisher = connected_publisher(&broker).await;

    let raw = broker.connect().create_channel().await.unwrap();
    raw.publish(
        EXCHANGE,
        Envelope {
            routing_key: "event-a".to_string(),
            content_type: Some("text/plain".to_string()),
            timestamp: None,
            body: b"hello".to_vec(),
        },
    )
    .await
    .unwrap();
    raw.publish(
        EXCHANGE,
        Envelope {
            routing_key: "event-a".to_string(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            timestamp: None,
            body: b"{not json".to_vec(),
        },
    )
    .await
    .unwrap();

    publisher
        .publish("event-b", &property("b"))
        .await
        .unwrap();
    publisher
        .publish("event-a", &property("a"))
        .await
        .unwrap();

    assert_eq!(recv(&mut event_b).await, property("b"));
    // Queue order is preserved, so both bad messages were settled first.
    assert_eq!(recv(&mut event_a).await, property("a"));
    assert_eq!(broker.discarded_count(), 2);
    assert_silent(&mut event_a).await;
    assert_eq!(broker.ready_count("event-a-events-queue-app"), 0);
    assert_eq!(broker.unacked_count("event-a-events-queue-app"), 0);
}

#[tokio::test]
async fn test_bad_messages_dead_lettered_when_configured() {
    let broker = InMemoryBroker::new();

    let inspector = broker.connect().create_channel().await.unwrap();
    inspector
        .declare_topic_exchange("dead-letters", ExchangeOptions::default())
        .await
        .unwrap();
    inspector
        .declare_queue("dead-letter-queue", QueueOptions::event_queue())
        .await
        .unwrap();
    inspector
        .bind_queue("dead-letter-queue", "dead-letters", "#")
        .await
        .unwrap();

    let consumer = connected_consumer(
        &broker,
        ConsumerOptions::new(NAMESPACE, ["event-a"])
            .with_app_id("app")
            .with_dead_letter_exchange("dead-letters"),
    )
    .await;
    let mut rx = consumer.subscribe("event-a");

    inspector
        .publish(
            EXCHANGE,
            Envelope {
                routing_key: "event-a".to_string(),
                content_type: Some("text/plain".to_string()),
                timestamp: None,
                body: b"hello".to_vec(),
            },
        )
        .await
        .unwrap();
    let publisher = connected_publisher(&broker).await;
    publisher.publish("event-a", &property("a")).await.unwrap();

    assert_eq!(recv(&mut rx).await, property("a"));
    assert_eq!(broker.ready_count("dead-letter-queue"), 1);
    assert_eq!(broker.discarded_count(), 0);
}

#[tokio::test]
async fn test_panicking_listener_keeps_subscription_alive() {
    let broker = InMemoryBroker::new();
    let consumer = connected_consumer(
        &broker,
        ConsumerOptions::new(NAMESPACE, ["fragile"]).with_app_id("app"),
    )
    .await;
    let mut rx = consumer.subscribe("fragile");
    consumer.on("fragile", |payload| {
        if payload["explode"] == json!(true) {
            panic!("listener exploded");
        }
    });
    let publisher = connected_publisher(&broker).await;

    publisher
        .publish("fragile", &json!({ "explode": true }))
        .await
        .unwrap();
    publisher
        .publish("fragile", &json!({ "explode": false }))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, json!({ "explode": true }));
    assert_eq!(recv(&mut rx).await, json!({ "explode": false }));
    assert_silent(&mut rx).await;

    let queue = "fragile-events-queue-app";
    assert_eq!(broker.ready_count(queue), 0);
    assert_eq!(broker.unacked_count(queue), 0);
}

#[tokio::test]
async fn test_reconnect_reuses_topology() {
    let broker = InMemoryBroker::new();
    let options = ConsumerOptions::new(NAMESPACE, ["event-1", "event-2"]).with_app_id("app");
    let mut consumer = Consumer::new(options).unwrap();
    let mut rx = consumer.subscribe("event-1");

    consumer.connect(broker.connect()).await.unwrap();
    let first_queues = broker.queue_names();
    consumer.close().await.unwrap();

    assert!(broker.queue_names().is_empty());
    assert!(broker.exchange_exists(EXCHANGE));

    consumer.connect(broker.connect()).await.unwrap();
    assert_eq!(broker.queue_names(), first_queues);
    assert_eq!(broker.bindings(EXCHANGE).len(), 2);

    let publisher = connected_publisher(&broker).await;
    publisher.publish("event-1", &property("again")).await.unwrap();
    assert_eq!(recv(&mut rx).await, property("again"));
}

#[tokio::test]
async fn test_events_published_without_consumers_are_dropped() {
    let broker = InMemoryBroker::new();
    let publisher = connected_publisher(&broker).await;

    publisher.publish("nobody-listens", &json!({})).await.unwrap();

    let consumer =
        connected_consumer(&broker, ConsumerOptions::new(NAMESPACE, ["nobody-listens"])).await;
    let mut rx = consumer.subscribe("nobody-listens");
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_publisher_and_consumer_share_a_connection() {
    let broker = InMemoryBroker::new();
    let connection = broker.connect();

    let mut consumer = Consumer::new(ConsumerOptions::new(NAMESPACE, ["ping"])).unwrap();
    let mut rx = consumer.subscribe("ping");
    consumer.connect(connection.clone()).await.unwrap();

    let mut publisher = Publisher::new(NAMESPACE).unwrap();
    publisher.connect(connection.clone()).await.unwrap();
    publisher.publish("ping", &json!({ "n": 1 })).await.unwrap();
    assert_eq!(recv(&mut rx).await, json!({ "n": 1 }));

    // Closing the publisher leaves the caller's connection open.
    publisher.close().await.unwrap();
    assert!(!connection.is_closed());
    consumer.close().await.unwrap();
    connection.close().await.unwrap();
    assert!(connection.is_closed());
}
