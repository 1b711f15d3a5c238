use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::*;
use crate::broker::{FieldMap, MemoryBroker, QueueOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PaymentCaptured {
    amount: u64,
}

impl DataContract for PaymentCaptured {
    const NAME: &'static str = "PaymentCaptured";
    const NAMESPACE: &'static str = "urn:payments";
}

#[derive(Default)]
struct Returns {
    returned: Mutex<Vec<(u16, String, String)>>,
}

impl DeliveryFailureHandler for Returns {
    fn delivery_failed(&self, reply_code: u16, reply_text: &str, message: &RawBusMessage) {
        self.returned
            .lock()
            .push((reply_code, reply_text.to_string(), message.name.clone()));
    }
}

async fn with_queue(broker: &MemoryBroker, queue: &str) {
    let channel = broker.open_channel().await.unwrap();
    channel
        .declare_queue(queue, QueueOptions::durable(), FieldMap::new())
        .await
        .unwrap();
}

fn to_queue(queue: &str) -> PublisherOptions {
    PublisherOptions::new().exchange("").routing_key(queue)
}

#[test]
fn test_options_destination() {
    let destination = PublisherOptions::new()
        .routing_key("payments")
        .mandatory(true)
        .persistent(true)
        .priority(3)
        .destination();

    assert_eq!(destination.exchange, "amq.headers");
    assert_eq!(destination.routing_key, "payments");
    assert!(destination.mandatory);
    assert!(destination.persistent);
    assert_eq!(destination.priority, Some(3));
    assert!(destination.reply_to.is_none());
}

#[tokio::test]
async fn test_publish_to_default_destination() {
    let broker = MemoryBroker::new();
    with_queue(&broker, "payments").await;
    let publisher = Publisher::open(
        Arc::new(broker.clone()),
        &BusContext::new("billing"),
        to_queue("payments"),
        Arc::new(TracingDeliveryFailureHandler),
    )
    .await
    .unwrap();

    publisher
        .publish(BusMessage::new(PaymentCaptured { amount: 1200 }))
        .await
        .unwrap();
    publisher
        .publish_blob(BusMessage::new(b"raw".to_vec()))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("payments"), Some(2));
}

#[tokio::test]
async fn test_unroutable_mandatory_message_reaches_failure_handler() {
    let broker = MemoryBroker::new();
    let returns = Arc::new(Returns::default());
    let publisher = Publisher::open(
        Arc::new(broker.clone()),
        &BusContext::new("billing"),
        PublisherOptions::new().mandatory(true),
        Arc::clone(&returns) as Arc<dyn DeliveryFailureHandler>,
    )
    .await
    .unwrap();

    publisher
        .publish(BusMessage::new(PaymentCaptured { amount: 5 }))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while returns.returned.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let returned = returns.returned.lock().clone();
    assert_eq!(
        returned,
        vec![(312, "NO_ROUTE".to_string(), "PaymentCaptured".to_string())]
    );
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let broker = MemoryBroker::new();
    with_queue(&broker, "ledger").await;
    let publisher = TransactionalPublisher::open(
        Arc::new(broker.clone()),
        &BusContext::new("billing"),
        to_queue("ledger"),
        Arc::new(TracingDeliveryFailureHandler),
    )
    .await
    .unwrap();

    publisher
        .publish(BusMessage::new(PaymentCaptured { amount: 1 }))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("ledger"), Some(0));

    publisher.rollback().await.unwrap();
    publisher.commit().await.unwrap();
    assert_eq!(broker.queue_depth("ledger"), Some(0));

    publisher
        .publish(BusMessage::new(PaymentCaptured { amount: 2 }))
        .await
        .unwrap();
    publisher
        .publish(BusMessage::new(PaymentCaptured { amount: 3 }))
        .await
        .unwrap();
    publisher.commit().await.unwrap();
    assert_eq!(broker.queue_depth("ledger"), Some(2));

    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_confirm_publisher_waits_for_acks() {
    let broker = MemoryBroker::new();
    with_queue(&broker, "ledger").await;
    let publisher = ConfirmPublisher::open(
        Arc::new(broker.clone()),
        &BusContext::new("billing"),
        to_queue("ledger"),
        Arc::new(TracingDeliveryFailureHandler),
    )
    .await
    .unwrap();

    publisher
        .publish(BusMessage::new(PaymentCaptured { amount: 9 }))
        .await
        .unwrap();

    assert!(publisher
        .wait_for_confirms(Duration::from_secs(1))
        .await
        .unwrap());
    assert_eq!(broker.queue_depth("ledger"), Some(1));
}

#[tokio::test]
async fn test_close_releases_channel() {
    let broker = MemoryBroker::new();
    let publisher = Publisher::open(
        Arc::new(broker.clone()),
        &BusContext::new("billing"),
        PublisherOptions::new(),
        Arc::new(TracingDeliveryFailureHandler),
    )
    .await
    .unwrap();
    assert_eq!(broker.channel_count(), 1);

    publisher.close().await.unwrap();

    assert_eq!(broker.channel_count(), 0);
}

#[tokio::test]
async fn test_close_while_blocked_leaves_channel_open() {
    let broker = MemoryBroker::new();
    let publisher = Publisher::open(
        Arc::new(broker.clone()),
        &BusContext::new("billing"),
        PublisherOptions::new(),
        Arc::new(TracingDeliveryFailureHandler),
    )
    .await
    .unwrap();

    broker.set_blocked(true);
    assert!(publisher.is_blocked().await);
    publisher.close().await.unwrap();

    assert_eq!(broker.channel_count(), 1);
}
