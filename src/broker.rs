// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The client never talks to the wire protocol directly. It issues the
//! primitives below against a `BrokerConnection` and the `BrokerChannel`s it
//! creates. `crate::amqp` implements them on top of lapin; any other transport
//! (or a recording fake in tests) can be plugged into the builder instead.

use crate::{
    errors::BrokerError,
    exchange::{ExchangeKind, ExchangeSettings},
    queue::QueueDeclaration,
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, sync::Arc};

/// Message headers as carried on the wire.
pub type Headers = BTreeMap<ShortString, AMQPValue>;

/// Properties stamped on a published message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Receives the deliveries and the cancel notification of one consumer.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);

    /// The broker stopped this consumer: its channel died, its queue was
    /// deleted, or it was cancelled explicitly.
    async fn cancelled(&self, consumer_tag: &str);
}

/// A transport to the broker, exclusively owned by the client.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A session multiplexed over a `BrokerConnection`.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        settings: &ExchangeSettings,
    ) -> Result<(), BrokerError>;

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), BrokerError>;

    /// Declares a queue and returns its name, which the broker assigns when
    /// the declaration carries none.
    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<String, BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn queue_delete(&self, queue: &str) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    /// Starts a consumer and returns its consumer tag.
    async fn basic_consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
