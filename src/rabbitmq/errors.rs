// src/rabbitmq/errors.rs

use std::time::Duration;

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable after {attempts} connection attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Publish to '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("No route to queue '{queue}'")]
    NoRoute { queue: String },

    #[error("Queue '{queue}' conflicts with an existing declaration: {reason}")]
    QueueConflict { queue: String, reason: String },

    #[error("RPC call to '{queue}' timed out after {timeout:?}")]
    RpcTimeout { queue: String, timeout: Duration },

    #[error("RPC call to '{queue}' was canceled")]
    Canceled { queue: String },

    #[error("Consumer on '{queue}' closed: {reason}")]
    ConsumerClosed { queue: String, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("RPC handler for '{queue}' failed: {message}")]
    Remote { queue: String, message: String },

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("AMQP protocol error: {0}")]
    Protocol(String),
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::InvalidChannelState(state) => {
                BrokerError::ChannelClosed(format!("channel is {:?}", state))
            }
            LapinError::InvalidConnectionState(state) => {
                BrokerError::ConnectionLost(format!("connection is {:?}", state))
            }
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}

impl BrokerError {
    /// Classify a failed `queue.declare`. The broker answers a declaration whose
    /// properties differ from the existing queue with PRECONDITION_FAILED, and an
    /// exclusive queue owned by another connection with RESOURCE_LOCKED.
    pub(crate) fn declare(queue: &str, error: LapinError) -> Self {
        if let LapinError::ProtocolError(amqp_error) = &error {
            if matches!(
                amqp_error.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                    | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED)
            ) {
                return BrokerError::QueueConflict {
                    queue: queue.to_string(),
                    reason: amqp_error.get_message().to_string(),
                };
            }
        }
        error.into()
    }

    pub(crate) fn publish(queue: &str, error: LapinError) -> Self {
        BrokerError::Publish {
            queue: queue.to_string(),
            reason: error.to_string(),
        }
    }

    /// True for the failures a caller of `send`/`call` sees when the broker did not
    /// take the message.
    pub fn is_publish_failure(&self) -> bool {
        matches!(self, BrokerError::Publish { .. } | BrokerError::NoRoute { .. })
    }

    /// True when the connection or channel underneath the operation is gone and the
    /// owner has to rebuild it.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionLost(_)
                | BrokerError::ChannelClosed(_)
                | BrokerError::ConsumerClosed { .. }
                | BrokerError::BrokerUnavailable { .. }
        )
    }
}

impl From<std::num::ParseIntError> for BrokerError {
    fn from(err: std::num::ParseIntError) -> Self {
        BrokerError::Config(format!("Parse error: {}", err))
    }
}
