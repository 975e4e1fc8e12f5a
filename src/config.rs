// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection parameters and channel pool bounds. Both are plain serde
//! structures so they can be loaded from any configuration source; they are
//! consumed once by `RabbitBuilder` and frozen afterwards.

use serde::Deserialize;
use std::{env, time::Duration};

/// Default operation deadline applied to every scheduled broker operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "thumper".to_owned(),
        }
    }
}

impl ConnectionConfig {
    /// Reads `RABBITMQ_*` variables, keeping defaults for the missing ones.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        ConnectionConfig {
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: env::var("RABBITMQ_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(defaults.port),
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            connection_name: env::var("APP_NAME").unwrap_or(defaults.connection_name),
        }
    }

    /// The AMQP URI for these parameters.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Bounds and validation policy of the channel pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_idle: usize,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
    pub idle_check_interval: Duration,
    pub wait_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_size: 16,
            min_idle: 0,
            test_on_borrow: true,
            test_on_return: true,
            test_while_idle: true,
            idle_check_interval: Duration::from_secs(30),
            wait_timeout: None,
        }
    }
}

impl PoolSettings {
    /// Maximum number of channels open at once.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Channels opened up front and kept ready.
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Checks a channel is open before handing it out.
    pub fn test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    /// Evicts a channel found closed when its lease is dropped.
    pub fn test_on_return(mut self, enabled: bool) -> Self {
        self.test_on_return = enabled;
        self
    }

    /// Periodically evicts idle channels found closed.
    pub fn test_while_idle(mut self, enabled: bool) -> Self {
        self.test_while_idle = enabled;
        self
    }

    /// Period of the idle check.
    pub fn idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    /// How long a borrow waits for a free channel once the pool is full.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}
