// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::env::BrokerAddress;
use crate::rabbitmq::channel_manager::ChannelConfig;
use crate::rabbitmq::connection::RetryPolicy;
use crate::rabbitmq::errors::BrokerError;

pub const CONFIG_FILE_NAME: &str = "rabbit-courier.json";

pub const ENV_CONNECT_ATTEMPTS: &str = "RMQ_CONNECT_ATTEMPTS";
pub const ENV_CONNECT_DELAY_SECS: &str = "RMQ_CONNECT_DELAY_SECS";
pub const ENV_PREFETCH_COUNT: &str = "RMQ_PREFETCH_COUNT";
pub const ENV_RPC_TIMEOUT_SECS: &str = "RMQ_RPC_TIMEOUT_SECS";

/// Everything a process needs to talk to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub broker: BrokerAddress,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

fn default_rpc_timeout_secs() -> u64 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerAddress::default(),
            retry: RetryPolicy::default(),
            channel: ChannelConfig::default(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// File settings (if a config file exists) with environment overrides on top.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match find_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No {} found, using defaults", CONFIG_FILE_NAME);
                Self::default()
            }
        };

        config
            .apply_overrides(|key| env::var(key).ok())
            .context("Invalid broker settings in environment")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config: ClientConfig = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON")?;

        if config.broker.host.is_empty() {
            anyhow::bail!("Configuration error: broker.host cannot be empty");
        }

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> std::result::Result<(), BrokerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.broker.apply_overrides(&lookup)?;

        if let Some(attempts) = lookup(ENV_CONNECT_ATTEMPTS) {
            self.retry.max_attempts = attempts.trim().parse()?;
            if self.retry.max_attempts == 0 {
                return Err(BrokerError::Config(format!(
                    "{ENV_CONNECT_ATTEMPTS} must be at least 1"
                )));
            }
        }
        if let Some(delay) = lookup(ENV_CONNECT_DELAY_SECS) {
            self.retry.delay_secs = delay.trim().parse()?;
        }
        if let Some(prefetch) = lookup(ENV_PREFETCH_COUNT) {
            self.channel.prefetch_count = prefetch.trim().parse()?;
        }
        if let Some(timeout) = lookup(ENV_RPC_TIMEOUT_SECS) {
            self.rpc_timeout_secs = timeout.trim().parse()?;
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

pub fn find_config_file() -> Option<PathBuf> {
    let config_dir = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", config_dir),
    ];

    for (location_name, path) in locations {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path);
        }
    }

    let home_config = home::home_dir()?.join(format!(".{}", CONFIG_FILE_NAME));
    if home_config.exists() {
        debug!("Found config file in home directory: {}", home_config.display());
        return Some(home_config);
    }

    None
}
