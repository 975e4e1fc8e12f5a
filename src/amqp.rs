// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! lapin implementation of the broker seam. A consumer stream is driven by a
//! spawned tokio task that hands each delivery to the registered handler and
//! fires the handler's cancel notification once the stream ends.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Delivery, DeliveryHandler, Headers, MessageProperties,
    },
    config::ConnectionConfig,
    errors::{BrokerError, RabbitError},
    exchange::{ExchangeKind, ExchangeSettings},
    queue::QueueDeclaration,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// A lapin connection.
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    /// Connects to the broker described by `cfg`.
    pub async fn connect(cfg: &ConnectionConfig) -> Result<Self, RabbitError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        match Connection::connect(&cfg.uri(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(LapinConnection { conn })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(RabbitError::Connection(err.into()))
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(err.into())
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.conn.close(REPLY_SUCCESS, "client closed").await?;
        Ok(())
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        settings: &ExchangeSettings,
    ) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: settings.durable,
                    auto_delete: settings.auto_delete,
                    internal: settings.internal,
                    nowait: false,
                },
                FieldTable::from(settings.arguments.clone()),
            )
            .await?;
        Ok(())
    }

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), BrokerError> {
        self.channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<String, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                declaration.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: false,
                },
                FieldTable::from(declaration.arguments()),
            )
            .await?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut props =
            BasicProperties::default().with_headers(FieldTable::from(properties.headers));
        if let Some(content_type) = properties.content_type {
            props = props.with_content_type(ShortString::from(content_type));
        }
        if let Some(content_encoding) = properties.content_encoding {
            props = props.with_content_encoding(ShortString::from(content_encoding));
        }
        if let Some(kind) = properties.kind {
            props = props.with_type(ShortString::from(kind));
        }
        if let Some(message_id) = properties.message_id {
            props = props.with_message_id(ShortString::from(message_id));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                props,
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, BrokerError> {
        let consumer_tag = format!("ctag-{}", Uuid::new_v4());

        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        let tag = consumer_tag.clone();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        handler
                            .handle(Delivery {
                                consumer_tag: tag.clone(),
                                delivery_tag: delivery.delivery_tag,
                                exchange: delivery.exchange.to_string(),
                                routing_key: delivery.routing_key.to_string(),
                                redelivered: delivery.redelivered,
                                properties: message_properties(&delivery.properties),
                                body: delivery.data,
                            })
                            .await
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            warn!(consumer_tag = tag, "consumer stream ended");
            handler.cancelled(&tag).await;
        });

        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel.close(REPLY_SUCCESS, "client closed").await?;
        Ok(())
    }
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.to_string());

    MessageProperties {
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        kind: text(props.kind()),
        message_id: text(props.message_id()),
        headers: props
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_else(Headers::new),
    }
}
