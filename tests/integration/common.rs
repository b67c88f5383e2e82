use std::time::Duration;

use lapin::options::QueueDeclareOptions;
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use rabbit_courier::{ClientConfig, ConnectionManager, RetryPolicy};
use uuid::Uuid;

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::load().expect("Failed to load broker settings");
    config.retry = RetryPolicy {
        max_attempts: 2,
        delay_secs: 1,
    };
    config
}

pub async fn connect() -> (ConnectionManager, lapin::Channel) {
    let manager = ConnectionManager::from_config(&test_config());
    let channel = manager
        .acquire_channel()
        .await
        .expect("RabbitMQ must be running for integration tests");
    (manager, channel)
}

/// A queue name no other test run uses.
pub fn unique_queue(prefix: &str) -> String {
    format!("{}-{}", prefix, &Uuid::new_v4().to_string()[..8])
}

/// Ask the broker whether `queue` is still declared. Runs on its own connection,
/// since a passive declare of a missing queue closes the channel it ran on.
pub async fn queue_exists(queue: &str) -> bool {
    let (manager, channel) = connect().await;
    let result = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await;
    manager.close().await.ok();

    match result {
        Ok(_) => true,
        Err(lapin::Error::ProtocolError(error)) => {
            !matches!(error.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        Err(e) => panic!("Failed to look up queue {}: {}", queue, e),
    }
}

/// Poll `condition` for up to five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

/// Poll the broker until `queue` is gone, for up to two seconds.
pub async fn queue_removed(queue: &str) -> bool {
    for _ in 0..20 {
        if !queue_exists(queue).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
