//! RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, order, OrderPlaced, PriceQuery, PriceQuote, WAIT};
use courier::broker::AmqpConnection;
use courier::{
    Bus, BusMessage, Filter, HandlerError, PublisherOptions, ReplyRouting, RpcCallError,
    RpcOptions, SubscriberOptions,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

async fn connect(url: &str, bus_id: &str) -> Bus {
    let connection = AmqpConnection::connect(url)
        .await
        .expect("Failed to connect to RabbitMQ");
    Bus::builder()
        .bus_id(bus_id)
        .connection(Arc::new(connection))
        .build()
        .expect("Failed to build bus")
}

#[tokio::test]
#[ignore = "requires Docker for the RabbitMQ container"]
async fn test_headers_exchange_filtering() {
    let (_container, url) = start_rabbitmq().await;
    let client = connect(&url, "client").await;
    let server = connect(&url, "server").await;

    let subscriber = server.subscriber(SubscriberOptions::new()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe(
            Filter::new().header("region", "eu"),
            move |msg: BusMessage<OrderPlaced>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg.data.order_id);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();
    subscriber.start().await.unwrap();

    let publisher = client.publisher(PublisherOptions::new()).await.unwrap();
    publisher
        .publish(BusMessage::new(order("us-1", 1)).with_header("region", "us"))
        .await
        .unwrap();
    publisher
        .publish(BusMessage::new(order("eu-1", 2)).with_header("region", "eu"))
        .await
        .unwrap();

    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, "eu-1");

    subscriber.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker for the RabbitMQ container"]
async fn test_rpc_over_fast_reply_and_dedicated_queue() {
    let (_container, url) = start_rabbitmq().await;
    let client = connect(&url, "client").await;
    let server = connect(&url, "server").await;

    let service = server.subscriber(SubscriberOptions::new()).await.unwrap();
    service
        .subscribe_reply(Filter::new(), |msg: BusMessage<PriceQuery>| async move {
            if msg.data.quantity == 0 {
                return Err(HandlerError::reject("empty order"));
            }
            Ok(PriceQuote {
                total_cents: 100 * u64::from(msg.data.quantity),
                sku: msg.data.sku,
            })
        })
        .await
        .unwrap();
    service.start().await.unwrap();

    for routing in [ReplyRouting::FastReply, ReplyRouting::dedicated()] {
        let rpc = client
            .rpc_publisher(
                RpcOptions::new()
                    .timeout(Duration::from_secs(10))
                    .reply_routing(routing),
            )
            .await
            .unwrap();

        let reply = rpc
            .call::<PriceQuery, PriceQuote>(BusMessage::new(PriceQuery {
                sku: "tea".to_string(),
                quantity: 3,
            }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data.total_cents, 300);

        let rejected = rpc
            .call::<PriceQuery, PriceQuote>(BusMessage::new(PriceQuery {
                sku: "tea".to_string(),
                quantity: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(rejected, RpcCallError::Reject("empty order".to_string()));

        rpc.close().await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires Docker for the RabbitMQ container"]
async fn test_transactional_redelivery() {
    let (_container, url) = start_rabbitmq().await;
    let client = connect(&url, "client").await;
    let server = connect(&url, "server").await;
    let queue = format!("orders-{}", uuid::Uuid::new_v4());
    let attempts = Arc::new(AtomicUsize::new(0));

    let subscriber = server
        .subscriber(SubscriberOptions::new().queue(queue).transactional())
        .await
        .unwrap();
    let counter = Arc::clone(&attempts);
    subscriber
        .subscribe(Filter::new(), move |_: BusMessage<OrderPlaced>| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(HandlerError::failed("transient"));
                }
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
    publisher.publish(BusMessage::new(order("o-1", 1))).await.unwrap();
    publisher.commit().await.unwrap();

    eventually(|| attempts.load(Ordering::SeqCst) == 2).await;

    subscriber.close().await.unwrap();
    publisher.close().await.unwrap();
}
