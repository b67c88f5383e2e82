use std::future::Future;

use futures::StreamExt;
use lapin::{options::QueueDeclareOptions, types::FieldTable, Channel};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::consumer::Subscription;
use super::envelope::{Envelope, Incoming};
use super::errors::{BrokerError, Result};
use super::publisher;

/// Fire-and-forget messaging over the shared channel.
#[derive(Clone)]
pub struct MessageQueueClient {
    channel: Channel,
}

impl MessageQueueClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Publish `payload` as JSON to `queue` and return once the broker has taken it.
    pub async fn send<T: Serialize + ?Sized>(&self, queue: &str, payload: &T) -> Result<()> {
        let envelope = Envelope::json(payload)?.with_correlation_id(Uuid::new_v4().to_string());

        publisher::publish(&self.channel, queue, &envelope, true)
            .await
            .map_err(|e| match e {
                BrokerError::NoRoute { queue } => BrokerError::Publish {
                    reason: format!("no queue bound for routing key '{}'", queue),
                    queue,
                },
                other => other,
            })?;

        info!(queue = %queue, "Published message");
        Ok(())
    }

    /// Declare the durable work queue `queue` and feed its deliveries to `handler`,
    /// one at a time and in delivery order. The handler acknowledges or rejects
    /// each message itself. Runs until the task is dropped or the channel closes,
    /// the latter ending in `ConsumerClosed`.
    pub async fn consume<F, Fut>(&self, queue: &str, mut handler: F, auto_delete: bool) -> Result<()>
    where
        F: FnMut(Incoming) -> Fut,
        Fut: Future<Output = ()>,
    {
        declare_work_queue(&self.channel, queue, auto_delete).await?;

        let (subscription, mut consumer) = Subscription::start(&self.channel, queue, "mq").await?;
        info!(queue = %queue, consumer_tag = %subscription.tag(), "Started consuming");

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    debug!(queue = %queue, delivery_tag = delivery.delivery_tag, "Received message");
                    handler(Incoming::from(delivery)).await;
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Consumer failed");
                    drop(subscription);
                    return Err(BrokerError::ConsumerClosed {
                        queue: queue.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        drop(subscription);
        Err(BrokerError::ConsumerClosed {
            queue: queue.to_string(),
            reason: "delivery stream ended".to_string(),
        })
    }
}

/// Declare a shared, durable work queue. Re-declaring with the same properties is
/// a no-op; different properties are a `QueueConflict`.
pub(crate) async fn declare_work_queue(channel: &Channel, queue: &str, auto_delete: bool) -> Result<()> {
    let declared = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                auto_delete,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::declare(queue, e))?;

    debug!(
        queue = %queue,
        messages = declared.message_count(),
        consumers = declared.consumer_count(),
        "Queue declared"
    );
    Ok(())
}
