//! Messaging between services over RabbitMQ: one managed connection and channel,
//! fire-and-forget queues, and request/reply calls with per-call reply queues.
//!
//! ```no_run
//! use std::time::Duration;
//! use rabbit_courier::{ClientConfig, ConnectionManager, RpcClient};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::load()?;
//! let manager = ConnectionManager::from_config(&config);
//! let channel = manager.acquire_channel().await?;
//!
//! let rpc = RpcClient::new(channel);
//! let doubled: i64 = rpc
//!     .call("double", &serde_json::json!({"value": 21}), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(doubled, 42);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::ClientConfig;
pub use env::BrokerAddress;
pub use rabbitmq::{
    BrokerError, ChannelConfig, ConnectionManager, Envelope, Incoming, MessageQueueClient,
    Result, RetryPolicy, RpcClient, RpcMethod, RpcServer,
};
