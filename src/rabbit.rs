// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Façade
//!
//! `Rabbit` owns the broker connection, the channel provider, the codec
//! registry, the executor and the set of live exchanges. Every broker
//! operation is one unit of work: obtain a channel from the provider, use it,
//! complete the returned `Pending`.
//!
//! `Rabbit::close` is terminal. Once it starts no operation can be scheduled
//! any more; it then closes exchanges (cascading into queues and
//! subscriptions), the channel provider, the connection and finally an owned
//! executor, attempting every step and reporting the failures together.

use crate::{
    broker::BrokerConnection,
    builder::RabbitBuilder,
    channel::{ChannelLease, ChannelProvider},
    errors::RabbitError,
    exchange::{self, Exchange, ExchangeInner, ExchangeKind, ExchangeSettings},
    executor::{with_deadline, Executor, Pending},
    registry::CodecRegistry,
    teardown::{self, CloseGate, Teardown},
};
use dashmap::DashMap;
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// State shared by the façade and, weakly, by every resource it created.
pub(crate) struct Core {
    connection: Arc<dyn BrokerConnection>,
    provider: Arc<dyn ChannelProvider>,
    pub(crate) codecs: Arc<CodecRegistry>,
    executor: Executor,
    pub(crate) timeout: Option<Duration>,
    closing: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
    pub(crate) exchanges: DashMap<u64, Arc<ExchangeInner>>,
    pub(crate) exchange_gate: CloseGate,
    next_id: AtomicU64,
}

impl Core {
    pub(crate) fn new(
        connection: Arc<dyn BrokerConnection>,
        provider: Arc<dyn ChannelProvider>,
        codecs: Arc<CodecRegistry>,
        executor: Executor,
        timeout: Option<Duration>,
    ) -> Self {
        Core {
            connection,
            provider,
            codecs,
            executor,
            timeout,
            closing: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(()),
            exchanges: DashMap::new(),
            exchange_gate: CloseGate::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Schedules `work` on the executor with a channel from the provider.
    ///
    /// Fails immediately with `RabbitError::Closed` once teardown began.
    pub(crate) fn schedule<R, F, Fut>(&self, work: F) -> Pending<R>
    where
        F: FnOnce(ChannelLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, RabbitError>> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_closing() {
            return Pending::failed(RabbitError::Closed);
        }

        let provider = self.provider.clone();
        self.executor.spawn(with_deadline(self.timeout, async move {
            let lease = provider.provide().await?;
            work(lease).await
        }))
    }

    /// Runs `work` with a channel on the awaiting task, ignoring the teardown
    /// gate. Used by the teardown itself.
    pub(crate) async fn run_now<R, F, Fut>(&self, work: F) -> Result<R, RabbitError>
    where
        F: FnOnce(ChannelLease) -> Fut,
        Fut: Future<Output = Result<R, RabbitError>>,
    {
        with_deadline(self.timeout, async {
            let lease = self.provider.provide().await?;
            work(lease).await
        })
        .await
    }
}

/// Asynchronous client over one broker connection.
pub struct Rabbit {
    core: Arc<Core>,
}

impl Rabbit {
    /// Starts configuring a client.
    pub fn builder() -> RabbitBuilder {
        RabbitBuilder::default()
    }

    pub(crate) fn new(core: Core) -> Self {
        Rabbit {
            core: Arc::new(core),
        }
    }

    /// Runs `work` with a channel and completes with its result.
    pub fn transform<R, F, Fut>(&self, work: F) -> Pending<R>
    where
        F: FnOnce(ChannelLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, RabbitError>> + Send + 'static,
        R: Send + 'static,
    {
        self.core.schedule(work)
    }

    /// Runs `work` with a channel for its side effects only.
    pub fn execute<F, Fut>(&self, work: F) -> Pending<()>
    where
        F: FnOnce(ChannelLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RabbitError>> + Send + 'static,
    {
        self.core.schedule(work)
    }

    /// Declares a direct exchange named `name`.
    pub fn direct(&self, name: &str) -> Pending<Exchange> {
        self.exchange(name, ExchangeKind::Direct)
    }

    /// Declares a topic exchange named `name`.
    pub fn topic(&self, name: &str) -> Pending<Exchange> {
        self.exchange(name, ExchangeKind::Topic)
    }

    /// Declares a fanout exchange named `name`.
    pub fn fanout(&self, name: &str) -> Pending<Exchange> {
        self.exchange(name, ExchangeKind::Fanout)
    }

    /// Declares the exchange with default settings and adds it to the live
    /// set. Declaring is idempotent on the broker.
    pub fn exchange(&self, name: &str, kind: ExchangeKind) -> Pending<Exchange> {
        let core = self.core.clone();
        let name = name.to_owned();

        self.core.schedule(move |lease| async move {
            exchange::declare(&lease, name.clone(), kind, &ExchangeSettings::default()).await?;

            let id = core.next_id();
            let inner = Arc::new(ExchangeInner::new(id, name, kind, Arc::downgrade(&core)));
            core.exchanges.insert(id, inner.clone());

            if core.is_closing() {
                core.exchanges.remove(&id);
                return Err(RabbitError::Closed);
            }

            Ok(Exchange { inner })
        })
    }

    /// The registry publishes and subscriptions look their codecs up in.
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.core.codecs
    }

    /// The executor every scheduled operation runs on.
    pub fn executor(&self) -> &Executor {
        &self.core.executor
    }

    /// Number of live exchanges.
    pub fn exchanges(&self) -> usize {
        self.core.exchanges.len()
    }

    /// True once `close` started.
    pub fn is_closed(&self) -> bool {
        self.core.is_closing()
    }

    /// Tears the client down.
    ///
    /// Every step is attempted even when earlier ones fail; failures are
    /// reported together as a `RabbitError::Composite`. A concurrent call
    /// waits for the first one to finish, later calls return `Ok(())` without
    /// doing anything.
    pub async fn close(&self) -> Result<(), RabbitError> {
        let _closing = self.core.close_lock.lock().await;
        if self.core.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing rabbit client...");

        let mut steps = Teardown::new();
        for exchange in teardown::drain(&self.core.exchanges) {
            steps.add("exchange", async move { exchange.close().await });
        }

        let core = &self.core;
        steps.add("exchanges in flight", async move {
            core.exchange_gate.settle().await;
            Ok(())
        });

        let timeout = self.core.timeout;
        let provider = self.core.provider.clone();
        steps.add("channel provider", async move {
            with_deadline(timeout, async move { provider.close().await }).await
        });

        let connection = self.core.connection.clone();
        steps.add("connection", async move {
            with_deadline(timeout, async {
                connection
                    .close()
                    .await
                    .map_err(|source| RabbitError::Close {
                        what: "connection",
                        source,
                    })
            })
            .await
        });

        let result = steps.execute().await;

        if self.core.executor.is_owned() {
            debug!("shutting down owned executor");
            self.core.executor.shutdown();
        }

        debug!("rabbit client closed");
        result
    }
}

impl fmt::Debug for Rabbit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rabbit")
            .field("exchanges", &self.core.exchanges.len())
            .field("executor", &self.core.executor)
            .field("closed", &self.core.is_closing())
            .finish()
    }
}
