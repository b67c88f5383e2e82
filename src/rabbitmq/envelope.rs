use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header set on replies that carry a handler failure instead of a result.
pub const FAILURE_HEADER: &str = "x-rpc-failure";

/// A message as it travels through the broker: body plus the routing metadata the
/// RPC protocol needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub failure: bool,
}

impl Envelope {
    /// JSON-encode `payload` into a new envelope.
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<Self> {
        Ok(Self {
            body: serde_json::to_vec(payload)?,
            content_type: JSON_CONTENT_TYPE.to_string(),
            correlation_id: None,
            reply_to: None,
            failure: false,
        })
    }

    /// An error-shaped reply: the body is the JSON-encoded message.
    pub fn failure(message: &str) -> Result<Self> {
        let mut envelope = Self::json(message)?;
        envelope.failure = true;
        Ok(envelope)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The text of an error-shaped reply, if this is one.
    pub fn failure_message(&self) -> Option<String> {
        if !self.failure {
            return None;
        }
        Some(
            serde_json::from_slice::<String>(&self.body)
                .unwrap_or_else(|_| String::from_utf8_lossy(&self.body).into_owned()),
        )
    }

    pub fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type(self.content_type.clone().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone().into());
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(reply_to.clone().into());
        }
        if self.failure {
            let mut headers = FieldTable::default();
            headers.insert(FAILURE_HEADER.into(), AMQPValue::Boolean(true));
            properties = properties.with_headers(headers);
        }
        properties
    }

    pub fn from_properties(properties: &BasicProperties, body: Vec<u8>) -> Self {
        let failure = properties.headers().as_ref().map_or(false, |headers| {
            headers
                .inner()
                .iter()
                .any(|(key, value)| key.as_str() == FAILURE_HEADER && matches!(value, AMQPValue::Boolean(true)))
        });

        Self {
            body,
            content_type: properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string())
                .unwrap_or_default(),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            reply_to: properties
                .reply_to()
                .as_ref()
                .map(|queue| queue.as_str().to_string()),
            failure,
        }
    }
}

/// A delivered message. The receiver owns the acknowledgment: call exactly one of
/// `ack`, `nack` or `reject`.
pub struct Incoming {
    pub envelope: Envelope,
    pub redelivered: bool,
    acker: Acker,
}

impl Incoming {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.envelope.decode()
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

impl From<Delivery> for Incoming {
    fn from(delivery: Delivery) -> Self {
        let envelope = Envelope::from_properties(&delivery.properties, delivery.data);
        Self {
            envelope,
            redelivered: delivery.redelivered,
            acker: delivery.acker,
        }
    }
}
