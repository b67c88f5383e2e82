use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions},
    types::FieldTable,
    Channel, Consumer,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::Result;

/// A consumer registered on the broker. Canceling it, explicitly or on drop,
/// stops deliveries and lets an auto-delete queue go away.
///
/// A counted subscription holds one unit of its counter until the broker has
/// confirmed the cancel, or the channel (and with it the consumer) is gone.
pub(crate) struct Subscription {
    channel: Channel,
    queue: String,
    tag: String,
    active: bool,
    registered: Option<Arc<AtomicUsize>>,
}

impl Subscription {
    pub(crate) async fn start(
        channel: &Channel,
        queue: &str,
        tag_prefix: &str,
    ) -> Result<(Self, Consumer)> {
        let tag = format!("{}-{}", tag_prefix, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %tag, "Consumer registered");
        Ok((
            Self {
                channel: channel.clone(),
                queue: queue.to_string(),
                tag,
                active: true,
                registered: None,
            },
            consumer,
        ))
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn counted(mut self, registered: Arc<AtomicUsize>) -> Self {
        registered.fetch_add(1, Ordering::SeqCst);
        self.registered = Some(registered);
        self
    }

    /// Cancel on the broker. If this fails, or the future is dropped before the
    /// broker answers, the drop path tries again.
    pub(crate) async fn cancel(mut self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .basic_cancel(&self.tag, BasicCancelOptions::default())
                .await?;
            debug!(queue = %self.queue, consumer_tag = %self.tag, "Consumer canceled");
        }
        self.active = false;
        release(self.registered.take());
        Ok(())
    }
}

fn release(registered: Option<Arc<AtomicUsize>>) {
    if let Some(registered) = registered {
        registered.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if !self.channel.status().connected() {
            release(self.registered.take());
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(consumer_tag = %self.tag, "No runtime to cancel consumer on drop");
            return;
        };

        let channel = self.channel.clone();
        let tag = std::mem::take(&mut self.tag);
        let registered = self.registered.take();
        runtime.spawn(async move {
            match channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                Ok(_) => release(registered),
                Err(e) => {
                    warn!(consumer_tag = %tag, error = %e, "Failed to cancel consumer");
                    if !channel.status().connected() {
                        release(registered);
                    }
                }
            }
        });
    }
}
