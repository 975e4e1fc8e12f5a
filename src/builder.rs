// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Builder
//!
//! Connection parameters, executor, channel policy, codecs and the operation
//! deadline are assembled here once. The built `Rabbit` never reconfigures
//! them.

use crate::{
    amqp::LapinConnection,
    broker::BrokerConnection,
    channel::{ChannelProvider, SingleChannelProvider},
    config::{ConnectionConfig, PoolSettings, DEFAULT_OPERATION_TIMEOUT},
    errors::RabbitError,
    executor::Executor,
    pool::PooledChannelProvider,
    rabbit::{Core, Rabbit},
    registry::CodecRegistry,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Assembles a `Rabbit`.
#[derive(Debug, Clone)]
pub struct RabbitBuilder {
    connection: ConnectionConfig,
    executor: Option<Executor>,
    codecs: Option<Arc<CodecRegistry>>,
    pool: Option<PoolSettings>,
    operation_timeout: Option<Duration>,
}

impl Default for RabbitBuilder {
    fn default() -> Self {
        RabbitBuilder {
            connection: ConnectionConfig::default(),
            executor: None,
            codecs: None,
            pool: None,
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
        }
    }
}

impl RabbitBuilder {
    /// Broker connection parameters used by `build`.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Where operations run. Defaults to the runtime calling `build`.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Runs every operation on the task awaiting it.
    pub fn direct_executor(self) -> Self {
        self.executor(Executor::Direct)
    }

    /// Borrows channels from a pool with default settings instead of sharing
    /// a single channel.
    pub fn pooled(self) -> Self {
        self.pooled_with(PoolSettings::default())
    }

    /// Borrows channels from a pool bounded by `settings`.
    pub fn pooled_with(mut self, settings: PoolSettings) -> Self {
        self.pool = Some(settings);
        self
    }

    /// Defaults to `CodecRegistry::with_defaults()`.
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Deadline of each operation; `None` disables it.
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Connects to the broker with lapin and builds the client.
    pub async fn build(self) -> Result<Rabbit, RabbitError> {
        let connection = LapinConnection::connect(&self.connection).await?;
        self.build_with_connection(Arc::new(connection)).await
    }

    /// Builds the client over an already established connection, which the
    /// client then owns.
    pub async fn build_with_connection(
        self,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Rabbit, RabbitError> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Executor::current()?,
        };

        let provider: Arc<dyn ChannelProvider> = match self.pool {
            Some(settings) => {
                debug!(max_size = settings.max_size, "using pooled channels");
                match PooledChannelProvider::new(connection.clone(), settings).await {
                    Ok(pool) => Arc::new(pool),
                    Err(err) => {
                        error!(error = err.to_string(), "failure to create the channel pool");
                        if let Err(close) = connection.close().await {
                            error!(error = close.to_string(), "error to close the connection");
                        }
                        return Err(err);
                    }
                }
            }
            None => Arc::new(SingleChannelProvider::new(connection.clone())),
        };

        let codecs = self
            .codecs
            .unwrap_or_else(|| Arc::new(CodecRegistry::with_defaults()));

        debug!(executor = ?executor, "rabbit client built");

        Ok(Rabbit::new(Core::new(
            connection,
            provider,
            codecs,
            executor,
            self.operation_timeout,
        )))
    }
}
