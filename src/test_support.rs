// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker recording every primitive issued against it.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryHandler, MessageProperties},
    errors::BrokerError,
    exchange::{ExchangeKind, ExchangeSettings},
    queue::QueueDeclaration,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateChannel(u16),
    ExchangeDeclare(String, ExchangeKind),
    ExchangeDelete(String),
    QueueDeclare(String),
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    QueueDelete(String),
    Publish {
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        channel: u16,
    },
    Cancel(String),
    Ack(u64),
    Nack(u64, bool),
    CloseChannel(u16),
    CloseConnection,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Journal {
    calls: Mutex<Vec<Call>>,
    published: Mutex<Vec<Published>>,
    failures: Mutex<Vec<(&'static str, Option<String>)>>,
    stalls: Mutex<Vec<&'static str>>,
    cancel_on_consume: AtomicBool,
    names: AtomicU64,
    deliveries: AtomicU64,
}

impl Journal {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check(&self, op: &'static str, target: &str) -> Result<(), BrokerError> {
        let failing = self.failures.lock().iter().any(|(failing_op, failing_target)| {
            *failing_op == op && failing_target.as_deref().map_or(true, |t| t == target)
        });

        if failing {
            return Err(BrokerError::Other(format!("{op} `{target}` refused")));
        }
        Ok(())
    }

    /// Never resolves when `op` was made to stall.
    async fn stall(&self, op: &'static str) {
        let stalled = self.stalls.lock().contains(&op);
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

pub struct FakeBroker {
    journal: Arc<Journal>,
    channels: DashMap<u16, Arc<FakeChannel>>,
    next_channel: AtomicU16,
    open: AtomicBool,
    create_delay: Option<Duration>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        Self::build(Some(delay))
    }

    fn build(create_delay: Option<Duration>) -> Arc<Self> {
        Arc::new(FakeBroker {
            journal: Arc::default(),
            channels: DashMap::new(),
            next_channel: AtomicU16::new(1),
            open: AtomicBool::new(true),
            create_delay,
        })
    }

    /// Makes `op` fail, for every target or only for `target`.
    pub fn fail(&self, op: &'static str, target: Option<&str>) {
        self.journal
            .failures
            .lock()
            .push((op, target.map(str::to_owned)));
    }

    /// Makes `op` hang forever.
    pub fn stall(&self, op: &'static str) {
        self.journal.stalls.lock().push(op);
    }

    /// Makes the next consumer be cancelled by the broker before
    /// `basic_consume` returns its tag.
    pub fn cancel_next_consume(&self) {
        self.journal.cancel_on_consume.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.calls.lock().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.journal.published.lock().clone()
    }

    pub fn channels_created(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::CreateChannel(_)))
            .count()
    }

    pub fn channel(&self, id: u16) -> Option<Arc<FakeChannel>> {
        self.channels.get(&id).map(|entry| entry.value().clone())
    }

    /// Position of the first recorded call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    /// Hands a message to the consumer registered on `queue`.
    pub async fn deliver(&self, queue: &str, properties: MessageProperties, body: &[u8]) -> bool {
        let target = self.channels.iter().find_map(|entry| {
            let channel = entry.value();
            if !channel.is_open() {
                return None;
            }
            channel.consumer_on(queue)
        });

        let Some((consumer_tag, handler)) = target else {
            return false;
        };

        let delivery = Delivery {
            consumer_tag,
            delivery_tag: self.journal.deliveries.fetch_add(1, Ordering::SeqCst) + 1,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties,
            body: body.to_vec(),
        };
        handler.handle(delivery).await;
        true
    }
}

#[async_trait]
impl BrokerConnection for FakeBroker {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.journal.check("create_channel", "")?;

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(FakeChannel {
            id,
            open: AtomicBool::new(true),
            journal: self.journal.clone(),
            consumers: DashMap::new(),
        });
        self.channels.insert(id, channel.clone());
        self.journal.record(Call::CreateChannel(id));

        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.journal.record(Call::CloseConnection);
        self.journal.check("close_connection", "")?;

        self.open.store(false, Ordering::SeqCst);
        for entry in self.channels.iter() {
            entry.value().kill();
        }
        Ok(())
    }
}

pub struct FakeChannel {
    id: u16,
    open: AtomicBool,
    journal: Arc<Journal>,
    consumers: DashMap<String, (String, Arc<dyn DeliveryHandler>)>,
}

impl FakeChannel {
    /// Marks the channel closed without notifying its consumers.
    pub fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Closes the channel and fires the cancel notification of every
    /// consumer registered on it, as a broker does when a channel dies.
    pub async fn crash(&self) {
        self.kill();

        let consumers: Vec<_> = self
            .consumers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().1.clone()))
            .collect();
        self.consumers.clear();

        for (tag, handler) in consumers {
            handler.cancelled(&tag).await;
        }
    }

    fn consumer_on(&self, queue: &str) -> Option<(String, Arc<dyn DeliveryHandler>)> {
        self.consumers.iter().find_map(|entry| {
            let (consumer_queue, handler) = entry.value();
            (consumer_queue == queue).then(|| (entry.key().clone(), handler.clone()))
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed(self.id))
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        _settings: &ExchangeSettings,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.check("exchange_declare", name)?;
        self.journal
            .record(Call::ExchangeDeclare(name.to_owned(), kind));
        Ok(())
    }

    async fn exchange_delete(&self, name: &str, _if_unused: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.record(Call::ExchangeDelete(name.to_owned()));
        self.journal.check("exchange_delete", name)
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let name = match declaration.name() {
            "" => format!(
                "amq.gen-{}",
                self.journal.names.fetch_add(1, Ordering::SeqCst) + 1
            ),
            name => name.to_owned(),
        };
        self.journal.check("queue_declare", &name)?;
        self.journal.record(Call::QueueDeclare(name.clone()));
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.check("queue_bind", routing_key)?;
        self.journal.record(Call::QueueBind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.record(Call::QueueDelete(queue.to_owned()));
        self.journal.check("queue_delete", queue)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.check("basic_publish", exchange)?;
        self.journal.record(Call::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self.journal.published.lock().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body: payload.to_vec(),
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, BrokerError> {
        self.ensure_open()?;
        self.journal.check("basic_consume", queue)?;

        let consumer_tag = format!(
            "ctag-{}",
            self.journal.names.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.consumers
            .insert(consumer_tag.clone(), (queue.to_owned(), handler.clone()));
        self.journal.record(Call::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.clone(),
            channel: self.id,
        });

        if self.journal.cancel_on_consume.swap(false, Ordering::SeqCst) {
            self.consumers.remove(&consumer_tag);
            handler.cancelled(&consumer_tag).await;
        }
        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.record(Call::Cancel(consumer_tag.to_owned()));
        self.journal.check("basic_cancel", consumer_tag)?;

        if let Some((tag, (_, handler))) = self.consumers.remove(consumer_tag) {
            handler.cancelled(&tag).await;
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.record(Call::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.journal.record(Call::Nack(delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.journal.record(Call::CloseChannel(self.id));
        self.journal.stall("close_channel").await;
        self.journal.check("close_channel", "")?;
        self.kill();
        Ok(())
    }
}
