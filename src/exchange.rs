// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchanges
//!
//! An `Exchange` is a named routing entity created through `Rabbit::direct`,
//! `Rabbit::topic` or `Rabbit::fanout`. It publishes encoded messages, creates
//! queues bound to itself and owns those queues: closing an exchange closes
//! every queue it created before the exchange leaves the client's live set.

use crate::{
    broker::MessageProperties,
    channel::ChannelLease,
    errors::RabbitError,
    executor::Pending,
    otel,
    queue::{Queue, QueueDeclaration, QueueInner},
    rabbit::Core,
    teardown::{self, CloseGate, Teardown},
};
use dashmap::DashMap;
use lapin::types::{AMQPValue, ShortString};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Routing discipline of an exchange.
///
/// - Direct: routes on an exact match of the routing key
/// - Topic: routes on wildcard patterns of the routing key
/// - Fanout: broadcasts to every bound queue, routing keys are ignored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// The routing key actually used when publishing with `routing_key`.
    pub fn routing_key<'a>(&self, routing_key: &'a str) -> &'a str {
        match self {
            ExchangeKind::Fanout => "",
            _ => routing_key,
        }
    }

    /// The keys a new queue is bound with: every distinct requested key, or
    /// the single empty key on a fanout exchange.
    pub fn binding_keys(&self, routing_keys: &[&str]) -> Vec<String> {
        match self {
            ExchangeKind::Fanout => vec![String::new()],
            _ => join_routing_keys(routing_keys),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn join_routing_keys(routing_keys: &[&str]) -> Vec<String> {
    let mut joined: Vec<String> = Vec::with_capacity(routing_keys.len());
    for key in routing_keys {
        if !joined.iter().any(|known| known == key) {
            joined.push((*key).to_owned());
        }
    }
    joined
}

/// Broker-side settings of an exchange declaration.
///
/// Defaults to a non-durable exchange without auto-delete nor arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeSettings {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the exchange survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once its last binding is removed.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Adds one declaration argument, replacing a previous value of `key`.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Replaces every declaration argument.
    pub fn arguments(mut self, arguments: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.arguments = arguments;
        self
    }
}

pub(crate) struct ExchangeInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    core: Weak<Core>,
    pub(crate) queues: DashMap<u64, Arc<QueueInner>>,
    pub(crate) queue_gate: CloseGate,
    closed: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
}

impl ExchangeInner {
    pub(crate) fn new(id: u64, name: String, kind: ExchangeKind, core: Weak<Core>) -> Self {
        ExchangeInner {
            id,
            name,
            kind,
            core,
            queues: DashMap::new(),
            queue_gate: CloseGate::default(),
            closed: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn core(&self) -> Result<Arc<Core>, RabbitError> {
        if self.is_closed() {
            return Err(RabbitError::Closed);
        }
        self.core.upgrade().ok_or(RabbitError::Closed)
    }

    /// Leaves the client's live set, then closes every queue. Only the first
    /// call does anything; a concurrent call waits for it.
    pub(crate) async fn close(self: &Arc<Self>) -> Result<(), RabbitError> {
        let _closing = self.close_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(name = self.name, "closing exchange");

        let core = self.core.upgrade();
        let _pass = match &core {
            Some(core) => Some(core.exchange_gate.enter().await),
            None => None,
        };
        if let Some(core) = &core {
            core.exchanges.remove(&self.id);
        }

        let mut steps = Teardown::new();
        for queue in teardown::drain(&self.queues) {
            steps.add("queue", async move { queue.close().await });
        }
        let result = steps.execute().await;
        self.queue_gate.settle().await;

        debug!(name = self.name, "exchange closed");
        result
    }
}

/// Handle to a live exchange. Clones share the same exchange.
#[derive(Clone)]
pub struct Exchange {
    pub(crate) inner: Arc<ExchangeInner>,
}

impl Exchange {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.inner.kind
    }

    /// Number of live queues created through this exchange.
    pub fn queues(&self) -> usize {
        self.inner.queues.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Encodes `message` with the codec registered for `T` and publishes it.
    ///
    /// The publish is fire-and-forget: the returned future completes once the
    /// broker call returned, without waiting for a publisher confirm. The
    /// routing key is ignored by fanout exchanges.
    pub fn publish<T: 'static>(&self, routing_key: &str, message: &T) -> Pending<()> {
        let core = match self.inner.core() {
            Ok(core) => core,
            Err(err) => return Pending::failed(err),
        };

        let codec = match core.codecs.get::<T>() {
            Ok(codec) => codec,
            Err(err) => return Pending::failed(err),
        };

        let payload = match codec.encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), "failure to encode message");
                return Pending::failed(err.into());
            }
        };

        let mut properties = MessageProperties {
            content_type: Some(codec.content_type().to_owned()),
            content_encoding: codec.content_encoding().map(str::to_owned),
            kind: Some(std::any::type_name::<T>().to_owned()),
            message_id: Some(Uuid::new_v4().to_string()),
            headers: BTreeMap::new(),
        };
        otel::inject(&opentelemetry::Context::current(), &mut properties.headers);

        let exchange = self.inner.name.clone();
        let routing_key = self.inner.kind.routing_key(routing_key).to_owned();

        core.schedule(move |lease| async move {
            debug!(exchange, routing_key, "publishing message");

            match lease
                .basic_publish(&exchange, &routing_key, properties, &payload)
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), exchange, "error publishing message");
                    Err(RabbitError::Publish {
                        exchange,
                        source: err,
                    })
                }
                _ => Ok(()),
            }
        })
    }

    /// Declares the exchange with default settings.
    pub fn declare(&self) -> Pending<()> {
        self.declare_with(ExchangeSettings::default())
    }

    pub fn declare_with(&self, settings: ExchangeSettings) -> Pending<()> {
        let core = match self.inner.core() {
            Ok(core) => core,
            Err(err) => return Pending::failed(err),
        };

        let name = self.inner.name.clone();
        let kind = self.inner.kind;

        core.schedule(move |lease| async move { declare(&lease, name, kind, &settings).await })
    }

    /// Deletes the exchange on the broker.
    pub fn delete(&self) -> Pending<()> {
        self.remove(false)
    }

    /// Deletes the exchange on the broker unless queues are still bound.
    pub fn delete_if_unused(&self) -> Pending<()> {
        self.remove(true)
    }

    fn remove(&self, if_unused: bool) -> Pending<()> {
        let core = match self.inner.core() {
            Ok(core) => core,
            Err(err) => return Pending::failed(err),
        };

        let name = self.inner.name.clone();

        core.schedule(move |lease| async move {
            debug!(name, if_unused, "deleting exchange");

            match lease.exchange_delete(&name, if_unused).await {
                Err(err) => {
                    error!(error = err.to_string(), name, "error to delete the exchange");
                    Err(RabbitError::DeleteExchange { name, source: err })
                }
                _ => Ok(()),
            }
        })
    }

    /// Declares a server-named queue bound under `routing_key` and every key
    /// of `other_keys`.
    pub fn new_queue(&self, routing_key: &str, other_keys: &[&str]) -> Pending<Queue> {
        let mut keys = Vec::with_capacity(other_keys.len() + 1);
        keys.push(routing_key);
        keys.extend_from_slice(other_keys);

        self.new_queue_with(QueueDeclaration::server_named(), &keys)
    }

    /// Declares the queue described by `declaration` and binds it under every
    /// key of `routing_keys`.
    pub fn new_queue_with(
        &self,
        declaration: QueueDeclaration,
        routing_keys: &[&str],
    ) -> Pending<Queue> {
        let core = match self.inner.core() {
            Ok(core) => core,
            Err(err) => return Pending::failed(err),
        };

        let exchange = self.inner.clone();
        let keys = self.inner.kind.binding_keys(routing_keys);
        let weak_core = Arc::downgrade(&core);
        let id = core.next_id();

        core.schedule(move |lease| async move {
            let name = match lease.queue_declare(&declaration).await {
                Ok(name) => name,
                Err(err) => {
                    error!(error = err.to_string(), "error to declare the queue");
                    return Err(RabbitError::DeclareQueue {
                        name: declaration.name().to_owned(),
                        source: err,
                    });
                }
            };
            debug!(queue = name, exchange = exchange.name, "queue declared");

            for key in &keys {
                if let Err(err) = lease.queue_bind(&name, &exchange.name, key).await {
                    error!(error = err.to_string(), queue = name, "error to bind the queue");
                    discard_queue(&lease, &name).await;
                    return Err(RabbitError::BindQueue {
                        queue: name,
                        exchange: exchange.name.clone(),
                        routing_key: key.clone(),
                        source: err,
                    });
                }
            }

            let queue = Arc::new(QueueInner::new(
                id,
                name,
                keys,
                Arc::downgrade(&exchange),
                weak_core,
            ));
            exchange.queues.insert(id, queue.clone());

            if exchange.is_closed() {
                // A queue already drained by the exchange's close is deleted there.
                if exchange.queues.remove(&id).is_some() {
                    queue.mark_closed();
                    discard_queue(&lease, &queue.name).await;
                }
                return Err(RabbitError::Closed);
            }

            Ok(Queue { inner: queue })
        })
    }

    /// Closes every queue created through this exchange and removes the
    /// exchange from the client. The broker-side exchange is left in place.
    pub async fn close(&self) -> Result<(), RabbitError> {
        self.inner.close().await
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("queues", &self.inner.queues.len())
            .finish()
    }
}

/// Deletes a queue whose creation did not complete. Failures are only logged,
/// the creation error is what the caller sees.
async fn discard_queue(channel: &ChannelLease, name: &str) {
    if let Err(err) = channel.queue_delete(name).await {
        warn!(error = err.to_string(), queue = name, "error to delete an unused queue");
    }
}

pub(crate) async fn declare(
    channel: &ChannelLease,
    name: String,
    kind: ExchangeKind,
    settings: &ExchangeSettings,
) -> Result<(), RabbitError> {
    debug!(name, kind = kind.as_str(), "declaring exchange");

    match channel.exchange_declare(&name, kind, settings).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                name, "error to declare the exchange"
            );
            Err(RabbitError::DeclareExchange { name, source: err })
        }
        _ => {
            debug!(name, "exchange declared");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{gzip, Utf8Codec, GZIP_CONTENT_ENCODING, TEXT_CONTENT_TYPE},
        executor::Executor,
        rabbit::Rabbit,
        registry::CodecRegistry,
        test_support::{Call, FakeBroker},
    };

    async fn client(broker: &Arc<FakeBroker>) -> Rabbit {
        Rabbit::builder()
            .build_with_connection(broker.clone())
            .await
            .unwrap()
    }

    #[test]
    fn fanout_ignores_routing_keys() {
        assert_eq!(ExchangeKind::Fanout.routing_key("orders.created"), "");
        assert_eq!(ExchangeKind::Topic.routing_key("orders.*"), "orders.*");
        assert_eq!(
            ExchangeKind::Fanout.binding_keys(&["a", "b"]),
            vec![String::new()]
        );
    }

    #[test]
    fn binding_keys_are_deduplicated_in_order() {
        assert_eq!(
            ExchangeKind::Direct.binding_keys(&["b", "a", "b"]),
            vec!["b".to_owned(), "a".to_owned()]
        );
    }

    #[tokio::test]
    async fn creating_an_exchange_declares_it() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;

        let exchange = rabbit.topic("events").await.unwrap();

        assert_eq!(exchange.name(), "events");
        assert_eq!(exchange.kind(), ExchangeKind::Topic);
        assert_eq!(rabbit.exchanges(), 1);
        assert!(broker
            .calls()
            .contains(&Call::ExchangeDeclare("events".to_owned(), ExchangeKind::Topic)));
    }

    #[tokio::test]
    async fn publish_encodes_and_stamps_properties() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        exchange
            .publish("created", &"order-1".to_owned())
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "orders");
        assert_eq!(published[0].routing_key, "created");
        assert_eq!(published[0].body, b"order-1");
        assert_eq!(
            published[0].properties.content_type.as_deref(),
            Some(TEXT_CONTENT_TYPE)
        );
        assert!(published[0].properties.message_id.is_some());
    }

    #[tokio::test]
    async fn fanout_publishes_with_the_empty_key() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.fanout("broadcast").await.unwrap();

        exchange.publish("ignored", &vec![1u8, 2]).await.unwrap();

        assert_eq!(broker.published()[0].routing_key, "");
    }

    #[tokio::test]
    async fn compressed_codecs_set_the_content_encoding() {
        let broker = FakeBroker::new();
        let codecs = Arc::new(CodecRegistry::new());
        codecs.register_shared(gzip(Arc::new(Utf8Codec)));
        let rabbit = Rabbit::builder()
            .codecs(codecs)
            .build_with_connection(broker.clone())
            .await
            .unwrap();
        let exchange = rabbit.direct("logs").await.unwrap();

        exchange.publish("", &"x".repeat(512)).await.unwrap();

        let published = broker.published();
        assert_eq!(
            published[0].properties.content_encoding.as_deref(),
            Some(GZIP_CONTENT_ENCODING)
        );
        assert!(published[0].body.len() < 512);
    }

    #[tokio::test]
    async fn publishing_an_unregistered_type_fails_with_no_codec() {
        struct Unregistered;

        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        let err = exchange.publish("", &Unregistered).await.unwrap_err();

        assert!(matches!(err, RabbitError::NoCodec { .. }));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failures_carry_the_exchange() {
        let broker = FakeBroker::new();
        broker.fail("basic_publish", Some("orders"));
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        let err = exchange.publish("", &"x".to_owned()).await.unwrap_err();

        assert!(matches!(err, RabbitError::Publish { exchange, .. } if exchange == "orders"));
    }

    #[tokio::test]
    async fn new_queue_binds_every_routing_key() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        let queue = exchange.new_queue("created", &["updated"]).await.unwrap();

        assert!(queue.name().starts_with("amq.gen-"));
        assert_eq!(queue.routing_keys(), ["created", "updated"]);
        assert_eq!(exchange.queues(), 1);

        let binds: Vec<_> = broker
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::QueueBind { .. }))
            .collect();
        assert_eq!(binds.len(), 2);
    }

    #[tokio::test]
    async fn fanout_queues_bind_once() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.fanout("broadcast").await.unwrap();

        let queue = exchange.new_queue("a", &["b", "c"]).await.unwrap();

        assert!(broker.calls().contains(&Call::QueueBind {
            queue: queue.name().to_owned(),
            exchange: "broadcast".to_owned(),
            routing_key: String::new(),
        }));
        assert_eq!(queue.routing_keys(), [""]);
    }

    #[tokio::test]
    async fn named_queues_keep_their_name() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        let queue = exchange
            .new_queue_with(QueueDeclaration::new("billing").durable(), &["created"])
            .await
            .unwrap();

        assert_eq!(queue.name(), "billing");
    }

    #[tokio::test]
    async fn bind_failures_are_reported_with_the_key() {
        let broker = FakeBroker::new();
        broker.fail("queue_bind", Some("bad"));
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        let err = exchange.new_queue("good", &["bad"]).await.unwrap_err();

        assert!(matches!(err, RabbitError::BindQueue { routing_key, .. } if routing_key == "bad"));
        assert_eq!(exchange.queues(), 0);
        assert!(broker
            .calls()
            .contains(&Call::QueueDelete("amq.gen-1".to_owned())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_closes_tear_down_once() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();
        let queue = exchange.new_queue("created", &[]).await.unwrap();
        let subscription = queue
            .subscribe(crate::consumer::consumer_fn(|_: String| async {
                Ok::<(), crate::errors::BoxError>(())
            }))
            .await
            .unwrap();
        let tag = subscription.consumer_tag();

        let (client_closed, exchange_closed, queue_closed, subscription_closed) = tokio::join!(
            rabbit.close(),
            exchange.close(),
            queue.close(),
            subscription.close()
        );

        client_closed.unwrap();
        exchange_closed.unwrap();
        queue_closed.unwrap();
        subscription_closed.unwrap();

        let calls = broker.calls();
        let count = |wanted: &Call| calls.iter().filter(|call| *call == wanted).count();
        assert_eq!(count(&Call::CloseConnection), 1);
        assert_eq!(count(&Call::QueueDelete(queue.name().to_owned())), 1);
        assert_eq!(count(&Call::Cancel(tag.clone())), 1);

        let cancel = broker.position(|call| *call == Call::Cancel(tag.clone()));
        let delete = broker.position(|call| *call == Call::QueueDelete(queue.name().to_owned()));
        let channel = broker.position(|call| matches!(call, Call::CloseChannel(_)));
        assert!(cancel.unwrap() < delete.unwrap());
        assert!(delete.unwrap() < channel.unwrap());
        assert_eq!(rabbit.exchanges(), 0);
        assert_eq!(exchange.queues(), 0);
        assert_eq!(queue.subscriptions(), 0);
    }

    #[tokio::test]
    async fn declare_and_delete_hit_the_broker() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();

        exchange
            .declare_with(ExchangeSettings::new().durable())
            .await
            .unwrap();
        exchange.delete_if_unused().await.unwrap();

        assert!(broker
            .calls()
            .contains(&Call::ExchangeDelete("orders".to_owned())));
    }

    #[tokio::test]
    async fn close_cascades_to_queues_and_leaves_the_client() {
        let broker = FakeBroker::new();
        let rabbit = client(&broker).await;
        let exchange = rabbit.direct("orders").await.unwrap();
        let queue = exchange.new_queue("created", &[]).await.unwrap();

        exchange.close().await.unwrap();
        exchange.close().await.unwrap();

        assert!(exchange.is_closed());
        assert!(queue.is_closed());
        assert_eq!(rabbit.exchanges(), 0);
        assert!(broker
            .calls()
            .contains(&Call::QueueDelete(queue.name().to_owned())));
        assert!(matches!(
            exchange.publish("", &"x".to_owned()).await,
            Err(RabbitError::Closed)
        ));
    }

    #[tokio::test]
    async fn direct_executor_runs_publishes_inline() {
        let broker = FakeBroker::new();
        let rabbit = Rabbit::builder()
            .executor(Executor::Direct)
            .build_with_connection(broker.clone())
            .await
            .unwrap();
        let exchange = rabbit.direct("orders").await.unwrap();

        let pending = exchange.publish("", &"x".to_owned());
        assert!(broker.published().is_empty());

        pending.await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }
}
