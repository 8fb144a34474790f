// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Connection settings for the RabbitMQ broker, loaded from environment
//! variables with local-development defaults.

use serde::Deserialize;
use std::env;
use thiserror::Error;

pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";

/// Configuration error type
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Connection details for the RabbitMQ broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Reported to the broker as the connection name
    pub app_name: String,
}

impl Default for RabbitMqConfigs {
    fn default() -> Self {
        RabbitMqConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            app_name: "rabbitmq-mq".to_owned(),
        }
    }
}

impl RabbitMqConfigs {
    /// Loads the configuration from `RABBITMQ_*` and `APP_NAME` variables,
    /// falling back to the defaults for every unset variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = RabbitMqConfigs::default();

        let port = match env::var(ENV_RABBITMQ_PORT) {
            Ok(raw) => raw.parse::<u16>().map_err(|err| ConfigError::ParseError {
                key: ENV_RABBITMQ_PORT.to_owned(),
                details: err.to_string(),
            })?,
            Err(_) => defaults.port,
        };

        Ok(RabbitMqConfigs {
            host: env_or(ENV_RABBITMQ_HOST, defaults.host),
            port,
            user: env_or(ENV_RABBITMQ_USER, defaults.user),
            password: env_or(ENV_RABBITMQ_PASSWORD, defaults.password),
            vhost: env_or(ENV_RABBITMQ_VHOST, defaults.vhost),
            app_name: env_or(ENV_APP_NAME, defaults.app_name),
        })
    }

    /// Builds the `amqp://` connection URI.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}
