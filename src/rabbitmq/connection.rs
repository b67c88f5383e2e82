use std::time::Duration;

use async_trait::async_trait;
use lapin::{Channel, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::channel_manager::{self, ChannelConfig};
use super::errors::{BrokerError, Result};
use crate::env::BrokerAddress;

/// How often and how patiently to dial the broker before giving up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_delay_secs() -> u64 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Opens connections and channels. `AmqpDialer` talks to a real broker.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Connection: Send + Sync;
    type Channel: Clone + Send + Sync;

    async fn dial(&self, url: &str) -> Result<Self::Connection>;

    async fn open_channel(&self, connection: &Self::Connection) -> Result<Self::Channel>;

    fn is_open(&self, channel: &Self::Channel) -> bool;
}

pub struct AmqpDialer {
    channel_config: ChannelConfig,
}

impl AmqpDialer {
    pub fn new(channel_config: ChannelConfig) -> Self {
        Self { channel_config }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    type Connection = Connection;
    type Channel = Channel;

    async fn dial(&self, url: &str) -> Result<Connection> {
        let connection = Connection::connect(
            url,
            channel_manager::connection_properties(&self.channel_config),
        )
        .await
        .map_err(|e| BrokerError::Connect(e.to_string()))?;

        connection.on_error(|err| {
            error!(error = %err, "Broker connection failed");
        });
        Ok(connection)
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel> {
        channel_manager::open_channel(connection, &self.channel_config).await
    }

    fn is_open(&self, channel: &Channel) -> bool {
        channel.status().connected()
    }
}

/// Owns the broker connection and the single channel every client shares.
///
/// The connection is dialed once. The channel is reopened on the next acquire if
/// the broker closed it (a failed passive or conflicting declaration does that);
/// clients holding the old channel have to be rebuilt from the new one.
pub struct ConnectionManager<D: Dialer = AmqpDialer> {
    address: BrokerAddress,
    retry: RetryPolicy,
    dialer: D,
    connection: OnceCell<D::Connection>,
    channel: Mutex<Option<D::Channel>>,
}

impl ConnectionManager<AmqpDialer> {
    pub fn new(address: BrokerAddress, retry: RetryPolicy, channel_config: ChannelConfig) -> Self {
        Self::with_dialer(address, retry, AmqpDialer::new(channel_config))
    }

    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self::new(
            config.broker.clone(),
            config.retry.clone(),
            config.channel.clone(),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .get()
            .map_or(false, |conn| conn.status().connected())
            && self
                .channel
                .try_lock()
                .ok()
                .and_then(|cached| cached.as_ref().map(|channel| channel.status().connected()))
                .unwrap_or(false)
    }

    // Method for properly closing the connection when needed
    pub async fn close(&self) -> Result<()> {
        if let Some(channel) = self.channel.lock().await.take() {
            if channel.status().connected() {
                channel.close(200, "Closing channel").await?;
            }
        }
        if let Some(conn) = self.connection.get() {
            if conn.status().connected() {
                info!("Closing broker connection gracefully");
                conn.close(200, "Closing connection").await?;
            }
        }
        Ok(())
    }
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn with_dialer(address: BrokerAddress, retry: RetryPolicy, dialer: D) -> Self {
        Self {
            address,
            retry,
            dialer,
            connection: OnceCell::new(),
            channel: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    /// The shared channel, dialing and opening it on first use. Concurrent first
    /// callers wait on the same attempt; later callers get the cached channel
    /// while it is open.
    pub async fn acquire_channel(&self) -> Result<D::Channel> {
        let mut cached = self.channel.lock().await;
        if let Some(channel) = cached.as_ref() {
            if self.dialer.is_open(channel) {
                return Ok(channel.clone());
            }
            warn!("Shared channel was closed by the broker, opening a new one");
        }

        let connection = self
            .connection
            .get_or_try_init(|| self.establish_connection())
            .await?;
        info!("Opening channel to broker");
        let channel = self.dialer.open_channel(connection).await?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    async fn establish_connection(&self) -> Result<D::Connection> {
        let url = self.address.url();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(attempt, max_attempts, "Connecting to broker at {}", self.address.redacted());

            match self.dialer.dial(&url).await {
                Ok(connection) => {
                    info!(attempt, "Connected to broker");
                    return Ok(connection);
                }
                Err(err) => {
                    if attempt >= max_attempts {
                        error!(attempt, max_attempts, error = %err, "Giving up on broker connection");
                        return Err(BrokerError::BrokerUnavailable {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }

                    warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "Can't connect to broker, retrying in {:?}",
                        self.retry.delay()
                    );
                    sleep(self.retry.delay()).await;
                }
            }
        }
    }
}
