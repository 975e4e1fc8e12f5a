// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriptions
//!
//! A `Subscription` is one consumer registration on a queue. It does not own
//! the channel its consumer runs on: it records a weak reference to it
//! together with the channel generation handed out by the provider, so a
//! replaced channel is visible as a generation change rather than as a
//! dangling handle.

use crate::{
    broker::{BrokerChannel, DeliveryHandler},
    channel::ChannelLease,
    consumer::{ConsumerRegistration, DeliveryCallback, DeliveryErrorReporter, DeliveryFailure},
    errors::RabbitError,
    executor::with_deadline,
    queue::QueueInner,
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tracing::{debug, error};

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Consuming, possibly on a channel that replaced the original one
    Active,
    /// The consumer was lost and could not be registered again
    Invalidated,
    /// Closed by its owner or by the cascade of its queue
    Closed,
}

struct ChannelBinding {
    channel: Weak<dyn BrokerChannel>,
    generation: u64,
    consumer_tag: String,
}

pub(crate) struct SubscriptionInner {
    queue_name: String,
    queue: Weak<QueueInner>,
    binding: Mutex<Option<ChannelBinding>>,
    state: Mutex<SubscriptionState>,
    /// Consumer tags the broker cancelled before they were filed on the queue.
    lost: Mutex<HashSet<String>>,
    close_lock: tokio::sync::Mutex<()>,
    registration: Arc<dyn ConsumerRegistration>,
    reporter: Arc<dyn DeliveryErrorReporter>,
    deadline: Option<Duration>,
}

impl SubscriptionInner {
    pub(crate) fn new(
        queue: &Arc<QueueInner>,
        registration: Arc<dyn ConsumerRegistration>,
        reporter: Arc<dyn DeliveryErrorReporter>,
        deadline: Option<Duration>,
    ) -> Self {
        SubscriptionInner {
            queue_name: queue.name.clone(),
            queue: Arc::downgrade(queue),
            binding: Mutex::new(None),
            state: Mutex::new(SubscriptionState::Active),
            lost: Mutex::new(HashSet::new()),
            close_lock: tokio::sync::Mutex::new(()),
            registration,
            reporter,
            deadline,
        }
    }

    pub(crate) fn queue(&self) -> Option<Arc<QueueInner>> {
        self.queue.upgrade()
    }

    /// The broker callback for a consumer registered on `lease`.
    pub(crate) fn handler(self: &Arc<Self>, lease: &ChannelLease) -> Arc<dyn DeliveryHandler> {
        Arc::new(DeliveryCallback {
            queue: self.queue_name.clone(),
            registration: self.registration.clone(),
            reporter: self.reporter.clone(),
            channel: Arc::downgrade(lease.channel()),
            channel_id: lease.id(),
            subscription: Arc::downgrade(self),
        })
    }

    pub(crate) fn bind(&self, lease: &ChannelLease, consumer_tag: String) {
        *self.binding.lock() = Some(ChannelBinding {
            channel: Arc::downgrade(lease.channel()),
            generation: lease.generation(),
            consumer_tag,
        });
    }

    pub(crate) fn consumer_tag(&self) -> String {
        self.binding
            .lock()
            .as_ref()
            .map(|binding| binding.consumer_tag.clone())
            .unwrap_or_default()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.binding
            .lock()
            .as_ref()
            .map_or(0, |binding| binding.generation)
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Active {
            *state = SubscriptionState::Invalidated;
        }
    }

    pub(crate) fn mark_lost(&self, consumer_tag: &str) {
        self.lost.lock().insert(consumer_tag.to_owned());
    }

    /// True, once, when `consumer_tag` was marked lost.
    pub(crate) fn take_lost(&self, consumer_tag: &str) -> bool {
        self.lost.lock().remove(consumer_tag)
    }

    pub(crate) fn report(&self, failure: DeliveryFailure) {
        self.reporter.report(failure);
    }

    /// Returns false when the subscription was already closed.
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Closed {
            return false;
        }
        *state = SubscriptionState::Closed;
        true
    }

    /// Closes the subscription: it leaves its queue and its broker consumer
    /// is cancelled if the channel it runs on is still open. A concurrent
    /// call waits for the first one.
    pub(crate) async fn close(self: &Arc<Self>) -> Result<(), RabbitError> {
        let _closing = self.close_lock.lock().await;
        if !self.mark_closed() {
            return Ok(());
        }

        let queue = self.queue.upgrade();
        let _pass = match &queue {
            Some(queue) => Some(queue.subscription_gate.enter().await),
            None => None,
        };

        let consumer_tag = self.consumer_tag();
        if let Some(queue) = &queue {
            queue
                .subscriptions
                .remove_if(&consumer_tag, |_, filed| Arc::ptr_eq(filed, self));
        }

        self.cancel().await
    }

    /// Marks the subscription closed and cancels its consumer, whatever its
    /// previous state.
    pub(crate) async fn discard(&self) -> Result<(), RabbitError> {
        let _closing = self.close_lock.lock().await;
        self.mark_closed();
        self.cancel().await
    }

    /// Cancels the current broker consumer. A consumer whose channel is gone
    /// or closed has nothing left to cancel.
    async fn cancel(&self) -> Result<(), RabbitError> {
        let bound = self.binding.lock().as_ref().and_then(|binding| {
            binding
                .channel
                .upgrade()
                .map(|channel| (channel, binding.consumer_tag.clone()))
        });

        let Some((channel, consumer_tag)) = bound else {
            return Ok(());
        };

        if !channel.is_open() {
            debug!(consumer_tag, "channel already closed, nothing to cancel");
            return Ok(());
        }

        debug!(queue = self.queue_name, consumer_tag, "cancelling consumer");

        with_deadline(self.deadline, async {
            match channel.basic_cancel(&consumer_tag).await {
                Err(err) => {
                    error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                    Err(RabbitError::Cancel {
                        consumer_tag: consumer_tag.clone(),
                        source: err,
                    })
                }
                _ => Ok(()),
            }
        })
        .await
    }
}

/// Handle to one consumer registration.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// The broker consumer tag. It changes when the subscription is
    /// registered again after losing its channel.
    pub fn consumer_tag(&self) -> String {
        self.inner.consumer_tag()
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    /// Generation of the channel the consumer currently runs on.
    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    pub async fn close(&self) -> Result<(), RabbitError> {
        self.inner.close().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.inner.queue_name)
            .field("consumer_tag", &self.inner.consumer_tag())
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::consumer_fn,
        errors::BoxError,
        queue::Queue,
        rabbit::Rabbit,
        test_support::{Call, FakeBroker},
    };

    async fn subscribed(broker: &Arc<FakeBroker>) -> (Rabbit, Queue, Subscription) {
        let rabbit = Rabbit::builder()
            .build_with_connection(broker.clone())
            .await
            .unwrap();
        let exchange = rabbit.fanout("events").await.unwrap();
        let queue = exchange.new_queue("", &[]).await.unwrap();
        let subscription = queue
            .subscribe(consumer_fn(|_: Vec<u8>| async { Ok::<(), BoxError>(()) }))
            .await
            .unwrap();
        (rabbit, queue, subscription)
    }

    #[tokio::test]
    async fn close_cancels_the_consumer_once() {
        let broker = FakeBroker::new();
        let (_rabbit, queue, subscription) = subscribed(&broker).await;
        let tag = subscription.consumer_tag();

        subscription.close().await.unwrap();
        subscription.close().await.unwrap();

        let cancels = broker
            .calls()
            .into_iter()
            .filter(|call| *call == Call::Cancel(tag.clone()))
            .count();
        assert_eq!(cancels, 1);
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert_eq!(queue.subscriptions(), 0);
    }

    #[tokio::test]
    async fn explicit_close_is_not_recovered() {
        let broker = FakeBroker::new();
        let (_rabbit, _queue, subscription) = subscribed(&broker).await;

        subscription.close().await.unwrap();

        let consumes = broker
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Consume { .. }))
            .count();
        assert_eq!(consumes, 1);
    }

    #[tokio::test]
    async fn close_skips_cancel_on_a_dead_channel() {
        let broker = FakeBroker::new();
        let (_rabbit, _queue, subscription) = subscribed(&broker).await;
        let tag = subscription.consumer_tag();
        broker.channel(1).unwrap().kill();

        subscription.close().await.unwrap();

        assert!(!broker.calls().contains(&Call::Cancel(tag)));
        assert_eq!(subscription.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn cancel_failures_surface() {
        let broker = FakeBroker::new();
        let (_rabbit, _queue, subscription) = subscribed(&broker).await;
        broker.fail("basic_cancel", None);

        let err = subscription.close().await.unwrap_err();

        assert!(matches!(err, RabbitError::Cancel { .. }));
        assert_eq!(subscription.state(), SubscriptionState::Closed);
    }
}
