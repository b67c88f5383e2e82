use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    Channel, Connection, ConnectionProperties,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::{BrokerError, Result};

/// Configuration options for the shared channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed per consumer (0 means unlimited)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Whether to use publisher confirms. Mandatory publishes can only report
    /// `NoRoute` when this is on.
    #[serde(default = "default_confirm_mode")]
    pub confirm_mode: bool,

    /// Channel identifier for logging, also sent as the connection name
    #[serde(default = "default_channel_id")]
    pub id: String,
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_confirm_mode() -> bool {
    true
}

fn default_channel_id() -> String {
    format!("channel-{}", &Uuid::new_v4().to_string()[..8])
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch_count(),
            confirm_mode: default_confirm_mode(),
            id: default_channel_id(),
        }
    }
}

pub fn connection_properties(config: &ChannelConfig) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(config.id.clone().into())
}

/// Open a channel on `connection` and apply QoS and confirm mode.
pub async fn open_channel(connection: &Connection, config: &ChannelConfig) -> Result<Channel> {
    debug!(
        channel_id = %config.id,
        prefetch = %config.prefetch_count,
        confirm = %config.confirm_mode,
        "Opening channel"
    );

    let channel = connection.create_channel().await?;

    if config.prefetch_count > 0 {
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Protocol(format!("Failed to set QoS: {}", e)))?;
    }

    if config.confirm_mode {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Protocol(format!("Failed to enable confirm mode: {}", e)))?;
    }

    info!(channel_id = %config.id, "Channel created and configured");
    Ok(channel)
}
