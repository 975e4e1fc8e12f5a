// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumers
//!
//! This module provides the consumer side of a subscription: the
//! `QueueConsumer` trait implemented by callers, the per-delivery pipeline
//! (trace context extraction, decoding, consuming, ack/nack) and the
//! reporting of delivery failures.
//!
//! Failures never escape the delivery callback. A delivery that cannot be
//! decoded, that the consumer rejects or whose consumer panics is nacked
//! without requeue and handed to the subscription's `DeliveryErrorReporter`.

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryHandler},
    codec::SharedCodec,
    errors::{BoxError, BrokerError, DeliveryError},
    otel,
    subscription::SubscriptionInner,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{
    any::Any,
    borrow::Cow,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Receives the decoded messages of a subscription.
#[async_trait]
pub trait QueueConsumer<T: Send + 'static>: Send + Sync {
    /// Handles one message. `ctx` continues the trace of the publisher.
    async fn consume(&self, ctx: &Context, message: T) -> Result<(), BoxError>;
}

/// Adapts an async closure into a `QueueConsumer`.
pub struct FnConsumer<T, F> {
    f: F,
    _message: PhantomData<fn(T)>,
}

/// Builds a consumer from `f`, which receives each decoded message.
pub fn consumer_fn<T, F, Fut>(f: F) -> FnConsumer<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnConsumer {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> QueueConsumer<T> for FnConsumer<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn consume(&self, _ctx: &Context, message: T) -> Result<(), BoxError> {
        (self.f)(message).await
    }
}

/// A delivery that could not be processed.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub queue: String,
    pub consumer_tag: String,
    /// Absent when the failure concerns the subscription itself.
    pub delivery_tag: Option<u64>,
    pub error: DeliveryError,
}

/// Observer of delivery failures, supplied at subscribe time.
pub trait DeliveryErrorReporter: Send + Sync {
    fn report(&self, failure: DeliveryFailure);
}

/// Logs delivery failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl DeliveryErrorReporter for LogReporter {
    fn report(&self, failure: DeliveryFailure) {
        error!(
            error = failure.error.to_string(),
            queue = failure.queue,
            consumer_tag = failure.consumer_tag,
            delivery_tag = failure.delivery_tag,
            "delivery failed"
        );
    }
}

impl DeliveryErrorReporter for mpsc::UnboundedSender<DeliveryFailure> {
    fn report(&self, failure: DeliveryFailure) {
        if let Err(err) = self.send(failure) {
            warn!(
                error = err.0.error.to_string(),
                "delivery failure dropped, receiver is gone"
            );
        }
    }
}

/// Type-erased decode-and-consume step of a subscription.
#[async_trait]
pub(crate) trait ConsumerRegistration: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn dispatch(&self, ctx: &Context, body: &[u8]) -> Result<(), DeliveryError>;
}

pub(crate) struct TypedRegistration<T> {
    codec: SharedCodec<T>,
    consumer: Arc<dyn QueueConsumer<T>>,
}

impl<T: Send + 'static> TypedRegistration<T> {
    pub(crate) fn new(codec: SharedCodec<T>, consumer: Arc<dyn QueueConsumer<T>>) -> Self {
        TypedRegistration { codec, consumer }
    }
}

#[async_trait]
impl<T: Send + 'static> ConsumerRegistration for TypedRegistration<T> {
    fn message_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    async fn dispatch(&self, ctx: &Context, body: &[u8]) -> Result<(), DeliveryError> {
        let message = self.codec.decode(body).map_err(DeliveryError::Decode)?;

        self.consumer
            .consume(ctx, message)
            .await
            .map_err(DeliveryError::Consumer)
    }
}

/// Broker callback of one consumer registration.
///
/// Acks and nacks go to the channel the consumer was registered on.
pub(crate) struct DeliveryCallback {
    pub(crate) queue: String,
    pub(crate) registration: Arc<dyn ConsumerRegistration>,
    pub(crate) reporter: Arc<dyn DeliveryErrorReporter>,
    pub(crate) channel: Weak<dyn BrokerChannel>,
    pub(crate) channel_id: u16,
    pub(crate) subscription: Weak<SubscriptionInner>,
}

impl DeliveryCallback {
    fn report(&self, delivery: &Delivery, error: DeliveryError) {
        self.reporter.report(DeliveryFailure {
            queue: self.queue.clone(),
            consumer_tag: delivery.consumer_tag.clone(),
            delivery_tag: Some(delivery.delivery_tag),
            error,
        });
    }
}

#[async_trait]
impl DeliveryHandler for DeliveryCallback {
    async fn handle(&self, delivery: Delivery) {
        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(
            &delivery.properties.headers,
            &tracer,
            self.registration.message_type(),
        );

        debug!(
            queue = self.queue,
            consumer_tag = delivery.consumer_tag,
            delivery_tag = delivery.delivery_tag,
            "received delivery"
        );

        let outcome = AssertUnwindSafe(self.registration.dispatch(&ctx, &delivery.body))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(DeliveryError::Panicked(panic_message(payload))));

        let Some(channel) = self.channel.upgrade() else {
            error!(channel = self.channel_id, "delivery channel is gone");
            let closed = BrokerError::ChannelClosed(self.channel_id);
            span.record_error(&closed);
            match outcome {
                Ok(()) => self.report(&delivery, DeliveryError::Ack(closed)),
                Err(failure) => {
                    self.report(&delivery, DeliveryError::Nack(closed));
                    self.report(&delivery, failure);
                }
            }
            return;
        };

        match outcome {
            Ok(()) => match channel.basic_ack(delivery.delivery_tag).await {
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    self.report(&delivery, DeliveryError::Ack(err));
                }
                _ => {
                    debug!("message successfully processed");
                    span.set_status(Status::Ok);
                }
            },
            Err(failure) => {
                error!(
                    error = failure.to_string(),
                    queue = self.queue,
                    "failure to process delivery, rejecting it"
                );
                span.record_error(&failure);
                span.set_status(Status::Error {
                    description: Cow::from(failure.to_string()),
                });

                if let Err(err) = channel.basic_nack(delivery.delivery_tag, false).await {
                    error!(error = err.to_string(), "error whiling nack msg");
                    self.report(&delivery, DeliveryError::Nack(err));
                }
                self.report(&delivery, failure);
            }
        }
    }

    async fn cancelled(&self, consumer_tag: &str) {
        debug!(queue = self.queue, consumer_tag, "consumer cancelled");

        let Some(subscription) = self.subscription.upgrade() else {
            return;
        };
        if let Some(queue) = subscription.queue() {
            queue.consumer_cancelled(&subscription, consumer_tag).await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "consumer panicked".to_owned(),
    }
}
