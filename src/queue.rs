// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! This module provides the queue declaration builder and the `Queue` handle.
//! A queue is created by an exchange, owns the subscriptions registered on it
//! and is deleted on the broker when closed.
//!
//! Subscriptions whose consumer is cancelled by the broker (most often because
//! the channel they were registered on died) are registered again on a fresh
//! channel. When that is impossible they are invalidated and the failure is
//! reported through the subscription's error reporter.

use crate::{
    channel::ChannelLease,
    consumer::{
        ConsumerRegistration, DeliveryErrorReporter, DeliveryFailure, LogReporter, QueueConsumer,
        TypedRegistration,
    },
    errors::{BrokerError, DeliveryError, RabbitError},
    exchange::ExchangeInner,
    executor::Pending,
    rabbit::Core,
    subscription::{Subscription, SubscriptionInner},
    teardown::{self, CloseGate, Teardown},
};
use dashmap::DashMap;
use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, warn};

pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Registrations tried for a subscription whose consumer keeps being
/// cancelled as soon as it is created.
const MAX_RECOVERY_ATTEMPTS: usize = 3;

/// Definition of a queue declaration.
///
/// This struct implements the builder pattern. An empty name lets the broker
/// assign one; see `QueueDeclaration::server_named` for the defaults used by
/// `Exchange::new_queue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDeclaration {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) extra: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDeclaration {
    /// Creates a new queue declaration with the given name.
    ///
    /// By default, the queue is non-durable, non-exclusive and not
    /// auto-deleted.
    pub fn new(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// A broker-named queue, exclusive to the connection and deleted once its
    /// last consumer is gone.
    pub fn server_named() -> QueueDeclaration {
        QueueDeclaration::new("").exclusive().auto_delete()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue once its last consumer is cancelled.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// When this limit is reached, the oldest messages will be discarded,
    /// or dead-lettered if a dead letter exchange is configured.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes rejected, expired and overflowing messages to `exchange`.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Overrides the routing key of dead-lettered messages.
    pub fn dead_letter_routing_key(mut self, routing_key: &str) -> Self {
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.extra.insert(ShortString::from(key), value);
        self
    }

    /// The `x-*` declaration arguments for the configured options.
    pub fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = self.extra.clone();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(routing_key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(routing_key.as_str())),
            );
        }

        args
    }
}

pub(crate) struct QueueInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    routing_keys: Vec<String>,
    exchange: Weak<ExchangeInner>,
    core: Weak<Core>,
    pub(crate) subscriptions: DashMap<String, Arc<SubscriptionInner>>,
    pub(crate) subscription_gate: CloseGate,
    closed: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
}

/// Outcome of registering a consumer.
enum Attach {
    Live,
    /// The broker cancelled the consumer before it was filed.
    Lost(String),
}

impl QueueInner {
    pub(crate) fn new(
        id: u64,
        name: String,
        routing_keys: Vec<String>,
        exchange: Weak<ExchangeInner>,
        core: Weak<Core>,
    ) -> Self {
        QueueInner {
            id,
            name,
            routing_keys,
            exchange,
            core,
            subscriptions: DashMap::new(),
            subscription_gate: CloseGate::default(),
            closed: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks a queue that never became live as closed.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn core(&self) -> Result<Arc<Core>, RabbitError> {
        if self.is_closed() {
            return Err(RabbitError::Closed);
        }
        self.core.upgrade().ok_or(RabbitError::Closed)
    }

    /// Starts a broker consumer for `subscription` on `lease` and files the
    /// subscription under its new consumer tag.
    async fn attach(
        self: &Arc<Self>,
        lease: &ChannelLease,
        subscription: &Arc<SubscriptionInner>,
    ) -> Result<Attach, RabbitError> {
        let handler = subscription.handler(lease);

        let consumer_tag = match lease.basic_consume(&self.name, handler).await {
            Ok(tag) => tag,
            Err(err) => {
                error!(error = err.to_string(), queue = self.name, "error to create the consumer");
                return Err(RabbitError::Consume {
                    queue: self.name.clone(),
                    source: err,
                });
            }
        };

        subscription.bind(lease, consumer_tag.clone());
        self.subscriptions
            .insert(consumer_tag.clone(), subscription.clone());
        debug!(
            queue = self.name,
            consumer_tag,
            channel = lease.id(),
            generation = lease.generation(),
            "consumer registered"
        );

        if self.is_closed() || subscription.is_closed() {
            self.subscriptions.remove(&consumer_tag);
            subscription.discard().await?;
            return Err(RabbitError::Closed);
        }

        // A cancel that arrived before the subscription was filed left a mark
        // instead of recovering it. Whoever unfiles the subscription recovers it.
        if subscription.take_lost(&consumer_tag)
            && self
                .subscriptions
                .remove_if(&consumer_tag, |_, filed| Arc::ptr_eq(filed, subscription))
                .is_some()
        {
            return Ok(Attach::Lost(consumer_tag));
        }

        Ok(Attach::Live)
    }

    /// Handles the broker cancelling the consumer `consumer_tag` of
    /// `subscription`.
    ///
    /// Subscriptions closed by their owner are no longer filed under their
    /// tag, so only unexpected cancellations are recovered. A cancel racing
    /// the registration is left for `attach` to find.
    pub(crate) async fn consumer_cancelled(
        self: &Arc<Self>,
        subscription: &Arc<SubscriptionInner>,
        consumer_tag: &str,
    ) {
        if subscription.is_closed() {
            return;
        }

        subscription.mark_lost(consumer_tag);
        let filed = self
            .subscriptions
            .remove_if(consumer_tag, |_, filed| Arc::ptr_eq(filed, subscription));
        if filed.is_none() {
            return;
        }
        subscription.take_lost(consumer_tag);

        self.recover(subscription, consumer_tag).await;
    }

    /// Registers `subscription` again on a fresh channel, or invalidates it
    /// and reports why.
    async fn recover(self: &Arc<Self>, subscription: &Arc<SubscriptionInner>, consumer_tag: &str) {
        let core = match self.core() {
            Ok(core) if !core.is_closing() => core,
            _ => {
                debug!(queue = self.name, consumer_tag, "consumer cancelled during teardown");
                subscription.invalidate();
                return;
            }
        };

        warn!(
            queue = self.name,
            consumer_tag, "consumer cancelled by the broker, registering it again"
        );

        let mut failure = None;
        for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
            let queue = self.clone();
            let recovered = subscription.clone();
            let result = core
                .schedule(move |lease| async move { queue.attach(&lease, &recovered).await })
                .await;

            match result {
                Ok(Attach::Live) => {
                    debug!(
                        queue = self.name,
                        consumer_tag = subscription.consumer_tag(),
                        attempt,
                        "subscription recovered"
                    );
                    return;
                }
                Ok(Attach::Lost(lost)) => warn!(
                    queue = self.name,
                    consumer_tag = lost,
                    attempt,
                    "consumer cancelled while registering it again"
                ),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let err = failure.unwrap_or_else(|| RabbitError::Consume {
            queue: self.name.clone(),
            source: BrokerError::Other(format!(
                "consumer cancelled {MAX_RECOVERY_ATTEMPTS} times while registering"
            )),
        });

        if subscription.is_closed() {
            debug!(queue = self.name, consumer_tag, "subscription closed while recovering");
            return;
        }

        error!(
            error = err.to_string(),
            queue = self.name,
            consumer_tag,
            "failure to recover subscription"
        );
        subscription.invalidate();
        subscription.report(DeliveryFailure {
            queue: self.name.clone(),
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag: None,
            error: DeliveryError::Recovery(Box::new(err)),
        });
    }

    /// Leaves the exchange's live set, closes every subscription and deletes
    /// the queue on the broker. Only the first call does anything; a
    /// concurrent call waits for it.
    pub(crate) async fn close(self: &Arc<Self>) -> Result<(), RabbitError> {
        let _closing = self.close_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(queue = self.name, "closing queue");

        let exchange = self.exchange.upgrade();
        let _pass = match &exchange {
            Some(exchange) => Some(exchange.queue_gate.enter().await),
            None => None,
        };
        if let Some(exchange) = &exchange {
            exchange.queues.remove(&self.id);
        }

        let mut steps = Teardown::new();
        for subscription in teardown::drain(&self.subscriptions) {
            steps.add("subscription", async move { subscription.close().await });
        }
        steps.add("subscriptions in flight", async {
            self.subscription_gate.settle().await;
            Ok(())
        });

        if let Some(core) = self.core.upgrade() {
            let name = self.name.clone();
            steps.add("queue delete", async move {
                core.run_now(move |lease| async move {
                    match lease.queue_delete(&name).await {
                        Err(err) => {
                            error!(error = err.to_string(), queue = name, "error to delete the queue");
                            Err(RabbitError::DeleteQueue { name, source: err })
                        }
                        _ => Ok(()),
                    }
                })
                .await
            });
        }

        let result = steps.execute().await;

        debug!(queue = self.name, "queue closed");
        result
    }
}

/// Handle to a live queue. Clones share the same queue.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn routing_keys(&self) -> &[String] {
        &self.inner.routing_keys
    }

    /// Number of live subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Subscribes `consumer` to messages of type `T`, logging per-delivery
    /// failures.
    pub fn subscribe<T, C>(&self, consumer: C) -> Pending<Subscription>
    where
        T: Send + 'static,
        C: QueueConsumer<T> + 'static,
    {
        self.subscribe_with(consumer, LogReporter)
    }

    /// Subscribes `consumer` to messages of type `T`.
    ///
    /// Each delivery is decoded with the codec registered for `T` and handed
    /// to `consumer`. Successful deliveries are acked. Decode and consumer
    /// failures nack the delivery without requeue and are handed to
    /// `reporter`.
    pub fn subscribe_with<T, C, R>(&self, consumer: C, reporter: R) -> Pending<Subscription>
    where
        T: Send + 'static,
        C: QueueConsumer<T> + 'static,
        R: DeliveryErrorReporter + 'static,
    {
        let core = match self.inner.core() {
            Ok(core) => core,
            Err(err) => return Pending::failed(err),
        };

        let codec = match core.codecs.get::<T>() {
            Ok(codec) => codec,
            Err(err) => return Pending::failed(err),
        };

        let registration: Arc<dyn ConsumerRegistration> =
            Arc::new(TypedRegistration::new(codec, Arc::new(consumer)));
        let subscription = Arc::new(SubscriptionInner::new(
            &self.inner,
            registration,
            Arc::new(reporter),
            core.timeout,
        ));
        let queue = self.inner.clone();

        core.schedule(move |lease| async move {
            if let Attach::Lost(consumer_tag) = queue.attach(&lease, &subscription).await? {
                drop(lease);
                queue.recover(&subscription, &consumer_tag).await;
            }
            Ok(Subscription {
                inner: subscription,
            })
        })
    }

    /// Cancels every subscription, deletes the queue on the broker and
    /// removes it from its exchange.
    pub async fn close(&self) -> Result<(), RabbitError> {
        self.inner.close().await
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("routing_keys", &self.inner.routing_keys)
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}
