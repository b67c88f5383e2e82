use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use rabbit_courier::{BrokerError, RpcClient, RpcMethod, RpcServer};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::common::{connect, queue_removed, unique_queue, wait_until};

#[derive(Debug, Serialize, Deserialize)]
struct DoubleRequest {
    value: i64,
}

struct Double;

impl RpcMethod for Double {
    type Request = DoubleRequest;
    type Response = i64;

    fn queue() -> &'static str {
        "double"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    id: usize,
    token: String,
}

async fn start_server<F, Fut, Req, Resp>(channel: lapin::Channel, queue: &str, handler: F)
where
    Req: serde::de::DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    let server = RpcServer::new(channel);
    let queue = queue.to_string();
    tokio::spawn(async move { server.consume(&queue, handler).await });
    // Give the server time to declare its queue and register.
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Take requests on `queue` and never answer them. Yields the reply address of
/// each request received.
async fn start_silent_server(channel: &lapin::Channel, queue: &str) -> mpsc::UnboundedReceiver<String> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    let mut consumer = channel
        .basic_consume(
            queue,
            &unique_queue("silent-server"),
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(delivery)) = consumer.next().await {
            if let Some(reply_to) = delivery.properties.reply_to() {
                let _ = tx.send(reply_to.as_str().to_string());
            }
        }
    });
    rx
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_double() {
    let (manager, channel) = connect().await;
    let server = RpcServer::new(channel.clone());
    tokio::spawn(async move {
        server
            .serve::<Double, _, _>(|request: DoubleRequest| async move {
                Ok::<_, anyhow::Error>(request.value * 2)
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = RpcClient::new(channel);
    let result = client
        .invoke::<Double>(&DoubleRequest { value: 21 }, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result, 42);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.reply_consumers(), 0);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_concurrent_calls_do_not_cross() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("echo-marker");
    start_server(channel.clone(), &queue, |marker: Marker| async move {
        // Stagger replies so they come back out of order.
        tokio::time::sleep(Duration::from_millis((marker.id % 5) as u64 * 30)).await;
        Ok::<_, anyhow::Error>(marker)
    })
    .await;

    let client = RpcClient::new(channel);
    let calls: Vec<_> = (0..25)
        .map(|id| {
            let client = client.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let token = uuid::Uuid::new_v4().to_string();
                let request = Marker { id, token: token.clone() };
                let reply: Marker = client.call(&queue, &request, Duration::from_secs(10)).await.unwrap();
                (id, token, reply)
            })
        })
        .collect();

    for call in calls {
        let (id, token, reply) = call.await.unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.token, token);
    }
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.reply_consumers(), 0);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_call_without_server_is_no_route() {
    let (manager, channel) = connect().await;
    let client = RpcClient::new(channel);

    let result: Result<i64, _> = client
        .call(&unique_queue("no-server"), &DoubleRequest { value: 1 }, Duration::from_secs(30))
        .await;

    assert!(matches!(result, Err(BrokerError::NoRoute { .. })));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.reply_consumers(), 0);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_timeout_cleans_up() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("slow");
    start_server(channel.clone(), &queue, |value: i64| async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok::<_, anyhow::Error>(value)
    })
    .await;

    let client = RpcClient::new(channel);
    let result: Result<i64, _> = client.call(&queue, &7, Duration::from_millis(300)).await;

    assert!(matches!(result, Err(BrokerError::RpcTimeout { .. })));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.reply_consumers(), 0);

    // The late reply lands nowhere and the next call still works.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let value: i64 = client.call(&queue, &8, Duration::from_secs(10)).await.unwrap();
    assert_eq!(value, 8);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_timeout_removes_reply_queue() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("silent");
    let mut reply_addresses = start_silent_server(&channel, &queue).await;

    let client = RpcClient::new(channel);
    let result: Result<i64, _> = client.call(&queue, &3, Duration::from_millis(300)).await;

    assert!(matches!(result, Err(BrokerError::RpcTimeout { .. })));
    let reply_to = reply_addresses.recv().await.unwrap();
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.reply_consumers(), 0);
    assert!(queue_removed(&reply_to).await);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_dropped_call_cleans_up() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("silent");
    let mut reply_addresses = start_silent_server(&channel, &queue).await;

    let client = RpcClient::new(channel);
    let call = client.call::<_, i64>(&queue, &4, Duration::from_secs(30));
    // Abandon the call while it waits for its reply.
    assert!(tokio::time::timeout(Duration::from_millis(300), call).await.is_err());

    let reply_to = reply_addresses.recv().await.unwrap();
    assert_eq!(client.in_flight(), 0);
    assert!(wait_until(|| client.reply_consumers() == 0).await);
    assert!(queue_removed(&reply_to).await);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_calls_dropped_at_any_point_release_consumers() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("silent");
    let _reply_addresses = start_silent_server(&channel, &queue).await;

    let client = RpcClient::new(channel);
    for delay_ms in [0u64, 1, 2, 5, 10, 20, 50] {
        let call = client.call_until::<_, i64, _>(
            &queue,
            &5,
            Duration::from_secs(30),
            tokio::time::sleep(Duration::from_millis(delay_ms)),
        );
        // Drop the call at staggered points, including while it is tearing down.
        let _ = tokio::time::timeout(Duration::from_millis(delay_ms), call).await;

        assert_eq!(client.in_flight(), 0);
        assert!(
            wait_until(|| client.reply_consumers() == 0).await,
            "reply consumer still registered after dropping at {}ms",
            delay_ms
        );
    }
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_cancel_cleans_up() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("never");
    start_server(channel.clone(), &queue, |value: i64| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, anyhow::Error>(value)
    })
    .await;

    let client = RpcClient::new(channel);
    let result: Result<i64, _> = client
        .call_until(&queue, &1, Duration::from_secs(30), tokio::time::sleep(Duration::from_millis(200)))
        .await;

    assert!(matches!(result, Err(BrokerError::Canceled { .. })));
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.reply_consumers(), 0);
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_handler_failure_is_reported() {
    let (manager, channel) = connect().await;
    let queue = unique_queue("failing");
    start_server(channel.clone(), &queue, |value: i64| async move {
        if value < 0 {
            anyhow::bail!("negative values are not accepted");
        }
        Ok(value)
    })
    .await;

    let client = RpcClient::new(channel);
    let result: Result<i64, _> = client.call(&queue, &-5, Duration::from_secs(5)).await;
    match result {
        Err(BrokerError::Remote { message, .. }) => {
            assert_eq!(message, "negative values are not accepted")
        }
        other => panic!("expected Remote error, got {:?}", other),
    }

    // The server keeps serving after a failed request.
    let value: i64 = client.call(&queue, &5, Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, 5);
    manager.close().await.unwrap();
}
