// src/rabbitmq/mod.rs
// Broker client: connection lifecycle, fire-and-forget messaging and RPC

pub mod channel_manager;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod message_queue;
pub mod pending;
pub mod request_response;
pub mod rpc_method;

// Private implementation details
mod consumer;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use channel_manager::ChannelConfig;
pub use connection::{AmqpDialer, ConnectionManager, Dialer, RetryPolicy};
pub use envelope::{Envelope, Incoming};
pub use errors::{BrokerError, Result};
pub use message_queue::MessageQueueClient;
pub use request_response::{RpcClient, RpcServer};
pub use rpc_method::RpcMethod;
