use std::env;

use serde::{Deserialize, Serialize};

use crate::rabbitmq::errors::{BrokerError, Result};

pub const ENV_SCHEME: &str = "RMQ_SCHEME";
pub const ENV_LOGIN: &str = "RMQ_LOGIN";
pub const ENV_PASSWORD: &str = "RMQ_PASSWORD";
pub const ENV_HOST: &str = "RMQ_HOST";
pub const ENV_PORT: &str = "RMQ_PORT";
pub const ENV_VHOST: &str = "RMQ_VHOST";

/// Where the broker lives and how to log in. Resolves to one connection URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAddress {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub vhost: String,
}

fn default_scheme() -> String {
    "amqp".to_string()
}

fn default_login() -> String {
    "user".to_string()
}

fn default_password() -> String {
    "bitnami".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5672
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            login: default_login(),
            password: default_password(),
            host: default_host(),
            port: default_port(),
            vhost: String::new(),
        }
    }
}

impl BrokerAddress {
    /// Defaults overridden by whatever `RMQ_*` variables are set (after `.env` is loaded).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut address = Self::default();
        address.apply_overrides(|key| env::var(key).ok())?;
        Ok(address)
    }

    /// Replace each field independently when `lookup` has a value for its variable.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(scheme) = lookup(ENV_SCHEME) {
            self.scheme = scheme;
        }
        if let Some(login) = lookup(ENV_LOGIN) {
            self.login = login;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = password;
        }
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .map_err(|e| BrokerError::Config(format!("{ENV_PORT}={port:?}: {e}")))?;
        }
        if let Some(vhost) = lookup(ENV_VHOST) {
            self.vhost = vhost;
        }
        Ok(())
    }

    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            self.scheme, self.login, self.password, self.host, self.port, self.vhost
        )
    }

    /// The URL with the password masked, for logs.
    pub fn redacted(&self) -> String {
        format!(
            "{}://{}:***@{}:{}/{}",
            self.scheme, self.login, self.host, self.port, self.vhost
        )
    }
}
