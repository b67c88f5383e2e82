use std::future::{self, Future};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, QueueDeclareOptions, QueueDeleteOptions},
    types::FieldTable,
    Channel, Consumer,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::consumer::Subscription;
use super::envelope::{Envelope, Incoming};
use super::errors::{BrokerError, Result};
use super::message_queue::declare_work_queue;
use super::pending::PendingCalls;
use super::publisher;
use super::rpc_method::RpcMethod;

/// Request/reply over the broker. Each call gets a private, auto-deleted reply
/// queue that is torn down when the call ends, however it ends.
#[derive(Clone)]
pub struct RpcClient {
    channel: Channel,
    pending: Arc<PendingCalls>,
    reply_consumers: Arc<AtomicUsize>,
}

enum Wake {
    Reply(std::result::Result<Result<Envelope>, RecvError>),
    Deadline,
    Canceled,
}

impl RpcClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            pending: Arc::new(PendingCalls::new()),
            reply_consumers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Calls currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Reply-queue consumers this client registered that the broker has not yet
    /// confirmed canceled.
    pub fn reply_consumers(&self) -> usize {
        self.reply_consumers.load(Ordering::SeqCst)
    }

    pub async fn invoke<M: RpcMethod>(&self, request: &M::Request, timeout: Duration) -> Result<M::Response> {
        self.call(M::queue(), request, timeout).await
    }

    /// Send `request` to `queue` and wait up to `timeout` for the reply.
    pub async fn call<T, R>(&self, queue: &str, request: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_until(queue, request, timeout, future::pending()).await
    }

    /// Like `call`, but gives up with `Canceled` as soon as `cancel` completes.
    pub async fn call_until<T, R, C>(
        &self,
        queue: &str,
        request: &T,
        timeout: Duration,
        cancel: C,
    ) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
        C: Future<Output = ()>,
    {
        let request = Envelope::json(request)?;

        let reply_queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::declare("(reply queue)", e))?;
        let reply_to = reply_queue.name().as_str().to_string();

        // The reply consumer exists before the request goes out, so no reply can
        // arrive unobserved.
        let (subscription, consumer) =
            match Subscription::start(&self.channel, &reply_to, "rpc-reply").await {
                Ok((subscription, consumer)) => (subscription.counted(self.reply_consumers.clone()), consumer),
                Err(e) => {
                    if let Err(delete_error) = self
                        .channel
                        .queue_delete(&reply_to, QueueDeleteOptions::default())
                        .await
                    {
                        warn!(reply_to = %reply_to, error = %delete_error, "Failed to delete reply queue");
                    }
                    return Err(e);
                }
            };
        let (correlation_id, mut receiver) = self.pending.register();
        let listener = ReplyListener::start(consumer, subscription, self.pending.clone(), correlation_id.clone());

        debug!(queue = %queue, correlation_id = %correlation_id, reply_to = %reply_to, "Sending RPC request");

        let request = request
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_to);
        if let Err(e) = publisher::publish(&self.channel, queue, &request, true).await {
            self.pending.claim(&correlation_id);
            listener.close().await;
            return Err(e);
        }

        let wake = tokio::select! {
            biased;
            reply = &mut receiver => Wake::Reply(reply),
            _ = sleep(timeout) => Wake::Deadline,
            _ = cancel => Wake::Canceled,
        };

        let outcome = match wake {
            Wake::Reply(Ok(outcome)) => outcome,
            Wake::Reply(Err(_)) => Err(BrokerError::ConnectionLost(
                "reply slot dropped".to_string(),
            )),
            Wake::Deadline => self.pending.settle(
                &correlation_id,
                &mut receiver,
                BrokerError::RpcTimeout {
                    queue: queue.to_string(),
                    timeout,
                },
            ),
            Wake::Canceled => self.pending.settle(
                &correlation_id,
                &mut receiver,
                BrokerError::Canceled {
                    queue: queue.to_string(),
                },
            ),
        };

        listener.close().await;

        let reply = outcome.map_err(|e| {
            warn!(queue = %queue, correlation_id = %correlation_id, error = %e, "RPC call failed");
            e
        })?;

        if let Some(message) = reply.failure_message() {
            return Err(BrokerError::Remote {
                queue: queue.to_string(),
                message,
            });
        }
        reply.decode()
    }
}

/// The consumer side of one call's reply queue. Dropping it, or calling `close`,
/// claims the pending entry and cancels the consumer.
struct ReplyListener {
    pending: Arc<PendingCalls>,
    correlation_id: String,
    subscription: Option<Subscription>,
    relay: JoinHandle<()>,
}

impl ReplyListener {
    fn start(consumer: Consumer, subscription: Subscription, pending: Arc<PendingCalls>, correlation_id: String) -> Self {
        let relay = tokio::spawn(relay_replies(consumer, pending.clone(), correlation_id.clone()));
        Self {
            pending,
            correlation_id,
            subscription: Some(subscription),
            relay,
        }
    }

    async fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Err(e) = subscription.cancel().await {
                warn!(correlation_id = %self.correlation_id, error = %e, "Failed to cancel reply consumer");
            }
        }
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.pending.claim(&self.correlation_id);
        self.relay.abort();
    }
}

async fn relay_replies(mut consumer: Consumer, pending: Arc<PendingCalls>, correlation_id: String) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                pending.fail(&correlation_id, BrokerError::ConnectionLost(e.to_string()));
                return;
            }
        };

        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to acknowledge reply");
        }

        let reply = Envelope::from_properties(&delivery.properties, delivery.data);
        route_reply(&pending, &correlation_id, reply);
    }

    pending.fail(
        &correlation_id,
        BrokerError::ConnectionLost("reply consumer closed".to_string()),
    );
}

/// Hand a reply to the one call that owns this reply queue. Replies carrying any
/// other correlation id are dropped.
fn route_reply(pending: &PendingCalls, correlation_id: &str, reply: Envelope) -> bool {
    match reply.correlation_id.clone() {
        Some(reply_id) if reply_id == correlation_id => {
            let delivered = pending.complete(correlation_id, reply);
            if delivered {
                debug!(correlation_id = %correlation_id, "Reply delivered");
            } else {
                debug!(correlation_id = %correlation_id, "Reply arrived after the call ended");
            }
            delivered
        }
        Some(reply_id) => {
            warn!(correlation_id = %correlation_id, reply_id = %reply_id, "Discarding reply for another call");
            false
        }
        None => {
            warn!(correlation_id = %correlation_id, "Discarding reply without correlation id");
            false
        }
    }
}

/// The responding side: consumes requests from a work queue and publishes each
/// handler result to the request's reply address.
///
/// A handler that returns `Err` or panics, and a request body that does not decode,
/// all produce an error-shaped reply; the request is then acknowledged. Requests
/// without `reply_to` or `correlation_id` are rejected without requeue.
#[derive(Clone)]
pub struct RpcServer {
    channel: Channel,
}

impl RpcServer {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub async fn serve<M, F, Fut>(&self, handler: F) -> Result<()>
    where
        M: RpcMethod,
        F: Fn(M::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Response>> + Send + 'static,
    {
        self.consume(M::queue(), handler).await
    }

    /// Serve requests on `queue` until the channel closes. Requests are handled
    /// concurrently, so replies may go out in a different order than requests came in.
    pub async fn consume<Req, Resp, F, Fut>(&self, queue: &str, handler: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        declare_work_queue(&self.channel, queue, false).await?;
        let (_subscription, mut consumer) = Subscription::start(&self.channel, queue, "rpc-server").await?;

        info!("RPC server started on queue: {}", queue);

        let handler = Arc::new(handler);
        let queue_name: Arc<str> = Arc::from(queue);

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let channel = self.channel.clone();
                    let handler = handler.clone();
                    let queue = queue_name.clone();

                    tokio::spawn(async move {
                        process_request(channel, &queue, Incoming::from(delivery), handler).await;
                    });
                }
                Err(e) => {
                    error!("Error receiving request on {}: {}", queue, e);
                    return Err(BrokerError::ConsumerClosed {
                        queue: queue.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(BrokerError::ConsumerClosed {
            queue: queue.to_string(),
            reason: "delivery stream ended".to_string(),
        })
    }
}

async fn process_request<Req, Resp, F, Fut>(channel: Channel, queue: &str, request: Incoming, handler: Arc<F>)
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    let (Some(reply_to), Some(correlation_id)) = (
        request.envelope.reply_to.clone(),
        request.envelope.correlation_id.clone(),
    ) else {
        error!(queue = %queue, "Received RPC request without reply_to or correlation_id");
        if let Err(e) = request.reject(false).await {
            error!("Failed to reject request: {}", e);
        }
        return;
    };

    let outcome = match request.decode::<Req>() {
        Ok(args) => run_handler(handler.as_ref(), args).await,
        Err(e) => Err(format!("invalid request: {}", e)),
    };
    if let Err(message) = &outcome {
        warn!(queue = %queue, correlation_id = %correlation_id, "Request failed: {}", message);
    }

    let reply = build_reply(&correlation_id, outcome);
    match publisher::publish(&channel, &reply_to, &reply, false).await {
        Ok(()) => {
            debug!(queue = %queue, correlation_id = %correlation_id, "Sent reply");
            if let Err(e) = request.ack().await {
                error!("Failed to acknowledge request: {}", e);
            }
        }
        Err(e) => {
            error!(queue = %queue, correlation_id = %correlation_id, "Failed to send reply: {}", e);
            if let Err(e) = request.reject(true).await {
                error!("Failed to requeue request: {}", e);
            }
        }
    }
}

/// Run the handler in its own task so a panic stays contained to this request.
async fn run_handler<Req, Resp, F, Fut>(handler: &F, args: Req) -> std::result::Result<Resp, String>
where
    Resp: Send + 'static,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    match tokio::spawn(handler(args)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(join_error) if join_error.is_panic() => Err("handler panicked".to_string()),
        Err(join_error) => Err(join_error.to_string()),
    }
}

fn build_reply<Resp: Serialize>(correlation_id: &str, outcome: std::result::Result<Resp, String>) -> Envelope {
    let envelope = match outcome {
        Ok(response) => Envelope::json(&response)
            .unwrap_or_else(|e| failure_envelope(&format!("failed to encode response: {}", e))),
        Err(message) => failure_envelope(&message),
    };
    envelope.with_correlation_id(correlation_id)
}

fn failure_envelope(message: &str) -> Envelope {
    Envelope::failure(message).unwrap_or_else(|_| Envelope {
        body: b"\"handler failed\"".to_vec(),
        content_type: super::envelope::JSON_CONTENT_TYPE.to_string(),
        correlation_id: None,
        reply_to: None,
        failure: true,
    })
}
