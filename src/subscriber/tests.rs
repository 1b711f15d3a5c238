use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::*;
use crate::broker::{BrokerConnection, ExchangeKind, MemoryBroker};
use crate::sender::{Destination, MessageSender};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ShipmentDispatched {
    seq: u32,
}

impl DataContract for ShipmentDispatched {
    const NAME: &'static str = "ShipmentDispatched";
    const NAMESPACE: &'static str = "urn:logistics";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ShipmentDelayed {
    hours: u32,
}

impl DataContract for ShipmentDelayed {
    const NAME: &'static str = "ShipmentDelayed";
    const NAMESPACE: &'static str = "urn:logistics";
}

#[derive(Debug, Clone, PartialEq)]
enum ShipmentEvent {
    Dispatched(ShipmentDispatched),
    Delayed(ShipmentDelayed),
}

impl From<ShipmentDispatched> for ShipmentEvent {
    fn from(e: ShipmentDispatched) -> Self {
        Self::Dispatched(e)
    }
}

impl From<ShipmentDelayed> for ShipmentEvent {
    fn from(e: ShipmentDelayed) -> Self {
        Self::Delayed(e)
    }
}

const WAIT: Duration = Duration::from_secs(5);

async fn publisher_for(broker: &MemoryBroker) -> MessageSender {
    let context = BusContext::new("publisher");
    MessageSender::new(
        broker.open_channel().await.unwrap(),
        "publisher",
        context.contracts,
        context.serializers.default_serializer(),
    )
}

async fn subscriber_for(broker: &MemoryBroker, options: SubscriberOptions) -> Subscriber {
    Subscriber::open(
        broker.open_channel().await.unwrap(),
        BusContext::new("subscriber"),
        options,
    )
    .await
    .unwrap()
}

fn headers() -> Destination {
    Destination::new(DEFAULT_EXCHANGE, "")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_subscribe_binds_and_delivers() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let added = subscriber
        .subscribe(Filter::new(), move |msg: BusMessage<ShipmentDispatched>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(added);
    assert_eq!(subscriber.subscription_count(), 1);

    subscriber.start().await.unwrap();
    assert!(subscriber.is_running());

    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 1 }), &headers())
        .await
        .unwrap();

    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.data, ShipmentDispatched { seq: 1 });
    assert_eq!(received.bus_id, "publisher");

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_second_subscription_for_same_type_is_ignored() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new()).await;

    let first = subscriber
        .subscribe(Filter::new(), |_: BusMessage<ShipmentDispatched>| async { Ok(()) })
        .await
        .unwrap();
    let second = subscriber
        .subscribe(Filter::new().header("region", "eu"), |_: BusMessage<ShipmentDispatched>| async {
            Ok(())
        })
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(subscriber.subscription_count(), 1);
}

#[tokio::test]
async fn test_header_filter_limits_binding() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    subscriber
        .subscribe(
            Filter::new().header("region", "eu"),
            move |msg: BusMessage<ShipmentDispatched>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg.data.seq);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let sender = publisher_for(&broker).await;
    sender
        .send(
            BusMessage::new(ShipmentDispatched { seq: 1 }).with_header("region", "us"),
            &headers(),
        )
        .await
        .unwrap();
    sender
        .send(
            BusMessage::new(ShipmentDispatched { seq: 2 }).with_header("region", "eu"),
            &headers(),
        )
        .await
        .unwrap();

    let seq = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seq, 2);
}

#[tokio::test]
async fn test_unsubscribe_removes_binding() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new().queue("shipments")).await;
    subscriber
        .subscribe(Filter::new(), |_: BusMessage<ShipmentDispatched>| async { Ok(()) })
        .await
        .unwrap();

    assert!(subscriber.unsubscribe::<ShipmentDispatched>().await.unwrap());
    assert!(!subscriber.unsubscribe::<ShipmentDispatched>().await.unwrap());
    assert_eq!(subscriber.subscription_count(), 0);

    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 1 }), &headers())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("shipments"), Some(0));
}

#[tokio::test]
async fn test_failed_bind_rolls_back_subscription() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(
        &broker,
        SubscriberOptions::new().exchange("missing.exchange"),
    )
    .await;

    let result = subscriber
        .subscribe(Filter::new(), |_: BusMessage<ShipmentDispatched>| async { Ok(()) })
        .await;

    assert!(result.is_err());
    assert_eq!(subscriber.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscribe_hierarchy() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new()).await;

    let none = subscriber
        .subscribe_hierarchy(Filter::new(), |_: BusMessage<ShipmentEvent>| async { Ok(()) })
        .await
        .unwrap();
    assert!(!none);

    subscriber
        .context
        .contracts
        .register_variant::<ShipmentEvent, ShipmentDispatched>()
        .unwrap();
    subscriber
        .context
        .contracts
        .register_variant::<ShipmentEvent, ShipmentDelayed>()
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let any = subscriber
        .subscribe_hierarchy(Filter::new(), move |msg: BusMessage<ShipmentEvent>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.data);
                Ok(())
            }
        })
        .await
        .unwrap();
    assert!(any);
    assert_eq!(subscriber.subscription_count(), 2);

    subscriber.start().await.unwrap();
    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDelayed { hours: 6 }), &headers())
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, ShipmentEvent::Delayed(ShipmentDelayed { hours: 6 }));

    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 4 }), &headers())
        .await
        .unwrap();
    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, ShipmentEvent::Dispatched(ShipmentDispatched { seq: 4 }));
}

struct Tracker {
    dispatched: AtomicUsize,
}

impl MessageSubscriptions for Tracker {
    fn subscriptions(self: Arc<Self>, set: &mut SubscriptionSet) -> Result<()> {
        let this = Arc::clone(&self);
        set.on(Filter::new(), move |_: BusMessage<ShipmentDispatched>| {
            let this = Arc::clone(&this);
            async move {
                this.dispatched.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })?;
        set.on(Filter::new(), |_: BusMessage<ShipmentDelayed>| async { Ok(()) })
    }
}

struct Conflicting;

impl MessageSubscriptions for Conflicting {
    fn subscriptions(self: Arc<Self>, set: &mut SubscriptionSet) -> Result<()> {
        set.on(Filter::new(), |_: BusMessage<ShipmentDispatched>| async { Ok(()) })?;
        set.on(Filter::new(), |_: BusMessage<ShipmentDispatched>| async { Ok(()) })
    }
}

#[tokio::test]
async fn test_register_subscriptions() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new()).await;
    let tracker = Arc::new(Tracker {
        dispatched: AtomicUsize::new(0),
    });

    let added = subscriber
        .register_subscriptions(Arc::clone(&tracker))
        .await
        .unwrap();
    assert_eq!(added, 2);

    subscriber.start().await.unwrap();
    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 9 }), &headers())
        .await
        .unwrap();

    eventually(|| tracker.dispatched.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_register_subscriptions_validates_before_binding() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new()).await;

    let err = subscriber
        .register_subscriptions(Arc::new(Conflicting))
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(subscriber.subscription_count(), 0);
}

#[tokio::test]
async fn test_single_concurrency_preserves_order() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new().concurrency(1)).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    subscriber
        .subscribe(Filter::new(), move |msg: BusMessage<ShipmentDispatched>| {
            let tx = tx.clone();
            async move {
                // Later messages would overtake earlier ones if run in parallel.
                tokio::time::sleep(Duration::from_millis(u64::from(10 - msg.data.seq))).await;
                let _ = tx.send(msg.data.seq);
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let sender = publisher_for(&broker).await;
    for seq in 0..10 {
        sender
            .send(BusMessage::new(ShipmentDispatched { seq }), &headers())
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 10 {
        seen.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let broker = MemoryBroker::new();
    let result = Subscriber::open(
        broker.open_channel().await.unwrap(),
        BusContext::new("subscriber"),
        SubscriberOptions::new().concurrency(0),
    )
    .await;

    assert!(result.err().unwrap().is_configuration());
}

#[tokio::test]
async fn test_transactional_failure_is_redelivered() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(
        &broker,
        SubscriberOptions::new().queue("picking").transactional(),
    )
    .await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<ShipmentDispatched>| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(HandlerError::failed("scanner offline"));
                }
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 1 }), &headers())
        .await
        .unwrap();

    eventually(|| attempts.load(Ordering::SeqCst) == 2).await;
    eventually(|| broker.unacked_count("picking") == 0).await;
    assert_eq!(broker.queue_depth("picking"), Some(0));
}

#[tokio::test]
async fn test_transactional_reject_is_dead_lettered() {
    let broker = MemoryBroker::new();
    let admin = broker.open_channel().await.unwrap();
    admin
        .declare_exchange("picking.dlx", ExchangeKind::Fanout, true)
        .await
        .unwrap();
    admin
        .declare_queue("picking.dead", QueueOptions::durable(), FieldMap::new())
        .await
        .unwrap();
    admin
        .bind_queue("picking.dead", "picking.dlx", "", FieldMap::new())
        .await
        .unwrap();

    let subscriber = subscriber_for(
        &broker,
        SubscriberOptions::new()
            .queue("picking")
            .durable(true)
            .transactional()
            .dead_letter_exchange("picking.dlx"),
    )
    .await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<ShipmentDispatched>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::reject("unknown warehouse"))
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 1 }), &headers())
        .await
        .unwrap();

    eventually(|| broker.queue_depth("picking.dead") == Some(1)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count("picking"), 0);
}

#[tokio::test]
async fn test_stop_cancels_consumer() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new().queue("loading")).await;
    subscriber.start().await.unwrap();
    subscriber.start().await.unwrap();
    assert_eq!(broker.consumer_count("loading"), Some(1));

    subscriber.stop().await.unwrap();

    assert!(!subscriber.is_running());
    assert_eq!(broker.consumer_count("loading"), Some(0));
}

#[tokio::test]
async fn test_concurrent_start_registers_one_consumer() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new().queue("sorting")).await;

    let (first, second) = tokio::join!(subscriber.start(), subscriber.start());
    first.unwrap();
    second.unwrap();

    assert_eq!(broker.consumer_count("sorting"), Some(1));
    subscriber.stop().await.unwrap();
    assert_eq!(broker.consumer_count("sorting"), Some(0));
}

#[tokio::test]
async fn test_stop_dispatches_already_pushed_deliveries() {
    let broker = MemoryBroker::new();
    let subscriber = subscriber_for(&broker, SubscriberOptions::new().queue("unloading")).await;
    let started = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let (on_start, on_done) = (Arc::clone(&started), Arc::clone(&handled));
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<ShipmentDispatched>| {
            let (started, handled) = (Arc::clone(&on_start), Arc::clone(&on_done));
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let sender = publisher_for(&broker).await;
    for seq in 0..3 {
        sender
            .send(BusMessage::new(ShipmentDispatched { seq }), &headers())
            .await
            .unwrap();
    }
    // No-ack mode: all three leave the queue as soon as they are pushed.
    eventually(|| started.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.queue_depth("unloading"), Some(0));

    subscriber.stop().await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_receiver_pulls_requested_contract() {
    let broker = MemoryBroker::new();
    let receiver = Receiver::open(
        broker.open_channel().await.unwrap(),
        BusContext::new("receiver"),
        SubscriberOptions::new(),
    )
    .await
    .unwrap();
    receiver.bind::<ShipmentDispatched>(Filter::new()).await.unwrap();

    let empty = receiver
        .receive::<ShipmentDispatched>(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(empty.is_none());

    let sender = publisher_for(&broker).await;
    sender
        .send(BusMessage::new(ShipmentDispatched { seq: 4 }), &headers())
        .await
        .unwrap();

    let message = receiver
        .receive::<ShipmentDispatched>(WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.data.seq, 4);

    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_receiver_skips_own_publications() {
    let broker = MemoryBroker::new();
    let context = BusContext::new("loopback");
    let receiver = Receiver::open(
        broker.open_channel().await.unwrap(),
        context.clone(),
        SubscriberOptions::new(),
    )
    .await
    .unwrap();
    receiver.bind::<ShipmentDispatched>(Filter::new()).await.unwrap();

    let own = MessageSender::new(
        broker.open_channel().await.unwrap(),
        "loopback",
        Arc::clone(&context.contracts),
        context.serializers.default_serializer(),
    );
    own.send(BusMessage::new(ShipmentDispatched { seq: 1 }), &headers())
        .await
        .unwrap();

    let message = receiver
        .receive::<ShipmentDispatched>(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(message.is_none());
}
