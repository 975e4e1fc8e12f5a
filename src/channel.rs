// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! A `ChannelProvider` hands out usable channels over the client's single
//! connection. Two policies exist: `SingleChannelProvider` shares one channel
//! and recreates it once it dies, `crate::pool::PooledChannelProvider`
//! borrows validated channels from a pool.
//!
//! Channels are handed out as `ChannelLease`s. A lease is scoped: dropping it
//! gives a pooled channel back, so no exit path can leak one.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::{BrokerError, RabbitError},
    pool::PooledChannel,
};
use async_trait::async_trait;
use deadpool::managed::Object;
use parking_lot::RwLock;
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Source of usable channels.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn provide(&self) -> Result<ChannelLease, RabbitError>;

    async fn close(&self) -> Result<(), RabbitError>;
}

/// A channel borrowed from a provider for the duration of one operation.
pub struct ChannelLease {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
    pooled: Option<Object<crate::pool::ChannelManager>>,
    test_on_return: bool,
}

impl ChannelLease {
    pub(crate) fn shared(channel: Arc<dyn BrokerChannel>, generation: u64) -> Self {
        ChannelLease {
            channel,
            generation,
            pooled: None,
            test_on_return: false,
        }
    }

    pub(crate) fn pooled(object: Object<crate::pool::ChannelManager>, test_on_return: bool) -> Self {
        let PooledChannel {
            channel,
            generation,
        } = &*object;

        ChannelLease {
            channel: channel.clone(),
            generation: *generation,
            pooled: Some(object),
            test_on_return,
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Identifies the channel instance; a recreated channel gets a new one.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(object) = self.pooled.take() else {
            return;
        };

        if self.test_on_return && !self.channel.is_open() {
            debug!(
                channel = self.channel.id(),
                "closed channel returned, evicting it from the pool"
            );
            let _ = Object::take(object);
        }
    }
}

/// One shared channel, created lazily and recreated when it is found closed.
pub struct SingleChannelProvider {
    connection: Arc<dyn BrokerConnection>,
    current: RwLock<Option<(Arc<dyn BrokerChannel>, u64)>>,
    create_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl SingleChannelProvider {
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        SingleChannelProvider {
            connection,
            current: RwLock::new(None),
            create_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn live(&self) -> Option<ChannelLease> {
        self.current
            .read()
            .as_ref()
            .filter(|(channel, _)| channel.is_open())
            .map(|(channel, generation)| ChannelLease::shared(channel.clone(), *generation))
    }
}

#[async_trait]
impl ChannelProvider for SingleChannelProvider {
    async fn provide(&self) -> Result<ChannelLease, RabbitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitError::ChannelUnavailable(BrokerError::Other(
                "channel provider is closed".to_owned(),
            )));
        }

        if let Some(lease) = self.live() {
            return Ok(lease);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(lease) = self.live() {
            return Ok(lease);
        }

        debug!("creating amqp channel...");
        let channel = match self.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(RabbitError::ChannelUnavailable(err));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(channel = channel.id(), generation, "channel created");

        *self.current.write() = Some((channel.clone(), generation));
        Ok(ChannelLease::shared(channel, generation))
    }

    /// Waits for an in-flight creation, so a channel opened concurrently is
    /// closed too.
    async fn close(&self) -> Result<(), RabbitError> {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.create_lock.lock().await;

        let current = self.current.write().take();
        let Some((channel, _)) = current else {
            return Ok(());
        };

        if !channel.is_open() {
            return Ok(());
        }

        debug!(channel = channel.id(), "closing channel");
        channel.close().await.map_err(|source| RabbitError::Close {
            what: "channel",
            source,
        })
    }
}
