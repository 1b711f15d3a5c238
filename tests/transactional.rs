//! Transactional publishing and acknowledged consumption.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{bus_pair, eventually, order, OrderPlaced, WAIT};
use courier::broker::MemoryBroker;
use courier::{BusMessage, Filter, HandlerError, PublisherOptions, SubscriberOptions};
use tokio::sync::{mpsc, Semaphore};

#[tokio::test]
async fn test_committed_messages_are_delivered_once() {
    let broker = MemoryBroker::new();
    let (client, server) = bus_pair(&broker);

    let subscriber = server
        .subscriber(SubscriberOptions::new().queue("fulfilment").transactional())
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe(Filter::new(), move |msg: BusMessage<OrderPlaced>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.data.order_id);
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = client
        .transactional_publisher(PublisherOptions::new())
        .await
        .unwrap();

    publisher.publish(BusMessage::new(order("discarded", 1))).await.unwrap();
    publisher.rollback().await.unwrap();

    publisher.publish(BusMessage::new(order("o-1", 1))).await.unwrap();
    publisher.publish(BusMessage::new(order("o-2", 2))).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
        .await
        .is_err());

    publisher.commit().await.unwrap();

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("o-1", "o-2"));

    eventually(|| broker.unacked_count("fulfilment") == 0).await;
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_failed_handler_is_retried_until_success() {
    let broker = MemoryBroker::new();
    let (client, server) = bus_pair(&broker);
    let attempts = Arc::new(AtomicUsize::new(0));

    let subscriber = server
        .subscriber(SubscriberOptions::new().queue("invoicing").transactional())
        .await
        .unwrap();
    let counter = Arc::clone(&attempts);
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<OrderPlaced>| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(HandlerError::failed("ledger locked"));
                }
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = client.publisher(PublisherOptions::new()).await.unwrap();
    publisher.publish(BusMessage::new(order("o-3", 3))).await.unwrap();

    eventually(|| attempts.load(Ordering::SeqCst) == 3).await;
    eventually(|| broker.unacked_count("invoicing") == 0).await;
    assert_eq!(broker.queue_depth("invoicing"), Some(0));
}

#[tokio::test]
async fn test_rejected_without_dead_letter_exchange_is_dropped() {
    let broker = MemoryBroker::new();
    let (client, server) = bus_pair(&broker);
    let attempts = Arc::new(AtomicUsize::new(0));

    let subscriber = server
        .subscriber(SubscriberOptions::new().queue("returns").transactional())
        .await
        .unwrap();
    let counter = Arc::clone(&attempts);
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<OrderPlaced>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::reject("not returnable"))
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = client.publisher(PublisherOptions::new()).await.unwrap();
    publisher.publish(BusMessage::new(order("o-4", 4))).await.unwrap();

    eventually(|| attempts.load(Ordering::SeqCst) == 1).await;
    eventually(|| broker.unacked_count("returns") == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth("returns"), Some(0));
}

#[tokio::test]
async fn test_prefetch_bounds_in_flight_deliveries() {
    let broker = MemoryBroker::new();
    let (client, server) = bus_pair(&broker);
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    let subscriber = server
        .subscriber(
            SubscriberOptions::new()
                .queue("packing")
                .transactional()
                .prefetch(2)
                .concurrency(4),
        )
        .await
        .unwrap();
    let (handler_gate, handler_started) = (Arc::clone(&gate), Arc::clone(&started));
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<OrderPlaced>| {
            let gate = Arc::clone(&handler_gate);
            let started = Arc::clone(&handler_started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await.map_err(HandlerError::from)?;
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = client.publisher(PublisherOptions::new()).await.unwrap();
    for n in 0..6 {
        publisher
            .publish(BusMessage::new(order(&format!("o-{}", n), n)))
            .await
            .unwrap();
    }

    eventually(|| started.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(broker.unacked_count("packing"), 2);
    assert_eq!(broker.queue_depth("packing"), Some(4));

    gate.add_permits(6);
    eventually(|| started.load(Ordering::SeqCst) == 6).await;
    eventually(|| broker.unacked_count("packing") == 0).await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_handler() {
    let broker = MemoryBroker::new();
    let (client, server) = bus_pair(&broker);
    let finished = Arc::new(AtomicUsize::new(0));

    let subscriber = server
        .subscriber(SubscriberOptions::new().queue("slow").transactional())
        .await
        .unwrap();
    let done = Arc::clone(&finished);
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<OrderPlaced>| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = client.publisher(PublisherOptions::new()).await.unwrap();
    publisher.publish(BusMessage::new(order("o-5", 5))).await.unwrap();
    eventually(|| broker.unacked_count("slow") == 1).await;

    subscriber.stop().await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count("slow"), 0);
}
