use lapin::{options::BasicPublishOptions, publisher_confirm::Confirmation, Channel};
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::errors::{BrokerError, Result};

/// Name of the broker's default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Publish `envelope` to `queue` through the default exchange and wait for the
/// broker's confirm. With `mandatory`, a message no queue would accept comes back
/// as `NoRoute` instead of being dropped.
///
/// lapin serializes frames per channel, so concurrent callers may share one channel.
pub(crate) async fn publish(
    channel: &Channel,
    queue: &str,
    envelope: &Envelope,
    mandatory: bool,
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            DEFAULT_EXCHANGE,
            queue,
            BasicPublishOptions {
                mandatory,
                ..BasicPublishOptions::default()
            },
            &envelope.body,
            envelope.properties(),
        )
        .await
        .map_err(|e| BrokerError::publish(queue, e))?;

    let confirmation = confirm.await.map_err(|e| BrokerError::publish(queue, e))?;

    match confirmation {
        Confirmation::Ack(Some(returned)) => {
            warn!(
                queue = %queue,
                reply_code = returned.reply_code,
                "Broker returned unroutable message"
            );
            Err(BrokerError::NoRoute {
                queue: queue.to_string(),
            })
        }
        Confirmation::Nack(_) => Err(BrokerError::Publish {
            queue: queue.to_string(),
            reason: "broker negatively acknowledged the message".to_string(),
        }),
        Confirmation::Ack(None) => {
            debug!(queue = %queue, "Publish confirmed");
            Ok(())
        }
        Confirmation::NotRequested => {
            if mandatory {
                debug!(queue = %queue, "Confirm mode is off, unroutable publishes go unnoticed");
            }
            Ok(())
        }
    }
}
