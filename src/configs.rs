// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings for RabbitMQ and the bus-wide defaults (exchange
//! name, confirm window, prefetch). Values come from `RABBITMQ_*`
//! environment variables, falling back to the local-development defaults.

use crate::errors::MessagingError;
use serde::Deserialize;
use std::{env, str::FromStr};

/// Default exchange shared by every message type on the bus.
pub const DEFAULT_EXCHANGE: &str = "client-manager";
/// Default bound on publishes awaiting a broker confirmation, per channel.
pub const DEFAULT_MAX_OUTSTANDING_CONFIRMS: usize = 1000;

/// RabbitMQ connection settings and bus defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub exchange: String,
    pub max_outstanding_confirms: usize,
    pub prefetch: u16,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            app_name: "client-manager".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            vhost: "/".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            exchange: DEFAULT_EXCHANGE.to_owned(),
            max_outstanding_confirms: DEFAULT_MAX_OUTSTANDING_CONFIRMS,
            prefetch: 10,
        }
    }
}

impl AmqpConfigs {
    /// Loads the configuration from the process environment.
    ///
    /// Missing variables keep their default. Numeric variables that fail to
    /// parse are reported instead of silently ignored.
    pub fn from_env() -> Result<AmqpConfigs, MessagingError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`AmqpConfigs::from_env`] but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<AmqpConfigs, MessagingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AmqpConfigs::default();

        Ok(AmqpConfigs {
            app_name: lookup("APP_NAME").unwrap_or(defaults.app_name),
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "RABBITMQ_PORT", defaults.port)?,
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            user: lookup("RABBITMQ_USER").unwrap_or(defaults.user),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            exchange: lookup("RABBITMQ_EXCHANGE").unwrap_or(defaults.exchange),
            max_outstanding_confirms: parse_var(
                &lookup,
                "RABBITMQ_MAX_OUTSTANDING_CONFIRMS",
                defaults.max_outstanding_confirms,
            )?,
            prefetch: parse_var(&lookup, "RABBITMQ_PREFETCH", defaults.prefetch)?,
        })
    }

    /// Renders the AMQP URI used to open the connection.
    ///
    /// The default vhost `/` must be percent-encoded in the URI path.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_owned()
        } else {
            self.vhost.trim_start_matches('/').to_owned()
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, MessagingError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| MessagingError::Config {
                key,
                reason: err.to_string(),
            }),
    }
}
