// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Pooling
//!
//! Pooled channel policy backed by `deadpool`. Channels are opened on the
//! client's connection when the pool is empty and under capacity, validated
//! (open check) on borrow, on return and periodically while idle, and dropped
//! from the pool once found closed.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    channel::{ChannelLease, ChannelProvider},
    config::PoolSettings,
    errors::{BrokerError, RabbitError},
    teardown::Teardown,
};
use async_trait::async_trait;
use deadpool::{
    managed::{Manager, Metrics, Pool, PoolError, RecycleError, RecycleResult},
    Runtime,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A channel owned by the pool.
pub struct PooledChannel {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) generation: u64,
}

/// Opens channels on the shared connection for the pool.
pub struct ChannelManager {
    connection: Arc<dyn BrokerConnection>,
    generation: AtomicU64,
    test_on_borrow: bool,
}

impl ChannelManager {
    pub fn new(connection: Arc<dyn BrokerConnection>, test_on_borrow: bool) -> Self {
        ChannelManager {
            connection,
            generation: AtomicU64::new(0),
            test_on_borrow,
        }
    }
}

impl Manager for ChannelManager {
    type Type = PooledChannel;
    type Error = BrokerError;

    async fn create(&self) -> Result<PooledChannel, BrokerError> {
        debug!("opening pooled channel...");
        let channel = match self.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to open pooled channel");
                return Err(err);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(channel = channel.id(), generation, "pooled channel opened");

        Ok(PooledChannel {
            channel,
            generation,
        })
    }

    async fn recycle(&self, obj: &mut PooledChannel, _: &Metrics) -> RecycleResult<BrokerError> {
        if self.test_on_borrow && !obj.channel.is_open() {
            debug!(channel = obj.channel.id(), "discarding closed pooled channel");
            return Err(RecycleError::Backend(BrokerError::ChannelClosed(
                obj.channel.id(),
            )));
        }

        Ok(())
    }
}

/// Borrows a validated channel from a pool for every operation.
pub struct PooledChannelProvider {
    pool: Pool<ChannelManager>,
    settings: PoolSettings,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PooledChannelProvider {
    /// Builds the pool and opens `min_idle` channels up front.
    pub async fn new(
        connection: Arc<dyn BrokerConnection>,
        settings: PoolSettings,
    ) -> Result<Self, RabbitError> {
        let manager = ChannelManager::new(connection, settings.test_on_borrow);

        let mut builder = Pool::builder(manager).max_size(settings.max_size.max(1));
        if let Some(wait) = settings.wait_timeout {
            builder = builder.wait_timeout(Some(wait)).runtime(Runtime::Tokio1);
        }

        let pool = builder
            .build()
            .map_err(|err| RabbitError::Pool(err.to_string()))?;

        fill(&pool, settings.min_idle).await;

        let sweeper = settings
            .test_while_idle
            .then(|| spawn_sweeper(pool.clone(), settings.clone()));

        Ok(PooledChannelProvider {
            pool,
            settings,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Channels currently resting in the pool.
    pub fn idle(&self) -> usize {
        self.pool.status().available
    }

    /// Channels currently owned by the pool, borrowed or idle.
    pub fn size(&self) -> usize {
        self.pool.status().size
    }
}

#[async_trait]
impl ChannelProvider for PooledChannelProvider {
    async fn provide(&self) -> Result<ChannelLease, RabbitError> {
        match self.pool.get().await {
            Ok(object) => Ok(ChannelLease::pooled(object, self.settings.test_on_return)),
            Err(PoolError::Backend(err)) => Err(RabbitError::ChannelUnavailable(err)),
            Err(PoolError::Closed) => Err(RabbitError::ChannelUnavailable(BrokerError::Other(
                "channel pool is closed".to_owned(),
            ))),
            Err(err) => {
                error!(error = err.to_string(), "error to borrow channel");
                Err(RabbitError::Pool(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), RabbitError> {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let drained = Mutex::new(vec![]);
        self.pool.retain(|pooled, _| {
            drained.lock().push(pooled.channel.clone());
            false
        });
        self.pool.close();

        let drained = drained.into_inner();
        debug!(channels = drained.len(), "closing pooled channels");

        let mut teardown = Teardown::new();
        for channel in drained.into_iter().filter(|channel| channel.is_open()) {
            teardown.add("pooled channel", async move {
                channel.close().await.map_err(|source| RabbitError::Close {
                    what: "channel",
                    source,
                })
            });
        }

        teardown.execute().await
    }
}

impl Drop for PooledChannelProvider {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

/// Borrows up to `target` channels at once so that many rest in the pool.
async fn fill(pool: &Pool<ChannelManager>, target: usize) {
    let mut held = Vec::with_capacity(target);

    while held.len() < target {
        match pool.get().await {
            Ok(object) => held.push(object),
            Err(err) => {
                warn!(error = err.to_string(), "failure to open idle channel");
                break;
            }
        }
    }
}

fn spawn_sweeper(pool: Pool<ChannelManager>, settings: PoolSettings) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.idle_check_interval);
        interval.tick().await;

        loop {
            interval.tick().await;

            let evicted = Mutex::new(0usize);
            pool.retain(|pooled, _| {
                let open = pooled.channel.is_open();
                if !open {
                    *evicted.lock() += 1;
                }
                open
            });

            let evicted = evicted.into_inner();
            if evicted > 0 {
                debug!(evicted, "evicted closed idle channels");
            }

            if pool.status().available < settings.min_idle {
                fill(&pool, settings.min_idle).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, FakeBroker};
    use std::time::Duration;

    fn settings() -> PoolSettings {
        PoolSettings::default().test_while_idle(false)
    }

    #[tokio::test]
    async fn reuses_returned_channels() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(broker.clone(), settings())
            .await
            .unwrap();

        let first = provider.provide().await.unwrap().id();
        let second = provider.provide().await.unwrap().id();

        assert_eq!(first, second);
        assert_eq!(broker.channels_created(), 1);
    }

    #[tokio::test]
    async fn concurrent_borrows_get_distinct_channels() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(broker.clone(), settings())
            .await
            .unwrap();

        let first = provider.provide().await.unwrap();
        let second = provider.provide().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(provider.size(), 2);
    }

    #[tokio::test]
    async fn closed_channels_are_never_handed_out_again() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(broker.clone(), settings())
            .await
            .unwrap();

        let lease = provider.provide().await.unwrap();
        let dead = lease.id();
        drop(lease);
        broker.channel(dead).unwrap().kill();

        let lease = provider.provide().await.unwrap();
        assert_ne!(lease.id(), dead);
        assert!(lease.is_open());
        assert_eq!(broker.channels_created(), 2);
    }

    #[tokio::test]
    async fn channels_dying_while_borrowed_are_evicted_on_return() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(broker.clone(), settings())
            .await
            .unwrap();

        let lease = provider.provide().await.unwrap();
        broker.channel(lease.id()).unwrap().kill();
        drop(lease);

        assert_eq!(provider.size(), 0);
    }

    #[tokio::test]
    async fn warms_min_idle_channels() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(broker.clone(), settings().min_idle(3))
            .await
            .unwrap();

        assert_eq!(broker.channels_created(), 3);
        assert_eq!(provider.idle(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_evicts_closed_channels() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(
            broker.clone(),
            PoolSettings::default().idle_check_interval(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let id = provider.provide().await.unwrap().id();
        assert_eq!(provider.idle(), 1);
        broker.channel(id).unwrap().kill();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(provider.size(), 0);
    }

    #[tokio::test]
    async fn close_drains_and_closes_idle_channels() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(broker.clone(), settings().min_idle(2))
            .await
            .unwrap();

        provider.close().await.unwrap();

        let closed = broker
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::CloseChannel(_)))
            .count();
        assert_eq!(closed, 2);
        assert!(matches!(
            provider.provide().await,
            Err(RabbitError::ChannelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn wait_timeout_bounds_borrows_on_a_full_pool() {
        let broker = FakeBroker::new();
        let provider = PooledChannelProvider::new(
            broker.clone(),
            settings()
                .max_size(1)
                .wait_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        let _held = provider.provide().await.unwrap();

        assert!(matches!(
            provider.provide().await,
            Err(RabbitError::Pool(_))
        ));
    }
}
