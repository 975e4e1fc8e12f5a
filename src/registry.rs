// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Codec Registry
//!
//! Resolves the codec for a message type. Direct registrations are consulted
//! first (last registration wins), then factories in registration order.
//! Factory results are not cached, so a direct registration made later always
//! takes precedence.
//!
//! The registry is a plain value: build one at startup, share it through an
//! `Arc`, and hand it to the client builder. Tests build isolated instances.

use crate::{
    codec::{BytesCodec, Codec, JsonCodec, SharedCodec, Utf8Codec},
    errors::RabbitError,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::{type_name, Any, TypeId},
    fmt,
    sync::Arc,
};
use tracing::warn;

/// Runtime identity of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    pub fn of<T: 'static>() -> Self {
        MessageType {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is the identity of `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A codec with its message type erased, as produced by factories.
#[derive(Clone)]
pub struct ErasedCodec {
    message_type: MessageType,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ErasedCodec {
    pub fn new<C: Codec>(codec: C) -> Self {
        Self::from_shared(Arc::new(codec) as SharedCodec<C::Message>)
    }

    pub fn from_shared<T: 'static>(codec: SharedCodec<T>) -> Self {
        ErasedCodec {
            message_type: MessageType::of::<T>(),
            inner: Arc::new(codec),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Recovers the typed codec, `None` when it serves another type.
    pub fn downcast<T: 'static>(&self) -> Option<SharedCodec<T>> {
        self.inner.downcast_ref::<SharedCodec<T>>().cloned()
    }
}

impl fmt::Debug for ErasedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedCodec")
            .field("message_type", &self.message_type.name)
            .finish()
    }
}

/// Fallback resolver consulted when no codec was registered directly.
pub trait CodecFactory: Send + Sync + 'static {
    fn create(&self, message_type: &MessageType) -> Option<ErasedCodec>;
}

impl<F> CodecFactory for F
where
    F: Fn(&MessageType) -> Option<ErasedCodec> + Send + Sync + 'static,
{
    fn create(&self, message_type: &MessageType) -> Option<ErasedCodec> {
        self(message_type)
    }
}

/// Thread-safe mapping from message type to codec.
pub struct CodecRegistry {
    codecs: DashMap<TypeId, ErasedCodec>,
    factories: RwLock<Arc<Vec<Arc<dyn CodecFactory>>>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        CodecRegistry {
            codecs: DashMap::new(),
            factories: RwLock::new(Arc::new(vec![])),
        }
    }

    /// A registry knowing `String` and `Vec<u8>` payloads.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Utf8Codec);
        registry.register(BytesCodec);
        registry
    }

    /// Installs `codec` for its message type, replacing any previous one.
    pub fn register<C: Codec>(&self, codec: C) {
        self.register_shared(Arc::new(codec) as SharedCodec<C::Message>);
    }

    pub fn register_shared<T: 'static>(&self, codec: SharedCodec<T>) {
        self.codecs
            .insert(TypeId::of::<T>(), ErasedCodec::from_shared(codec));
    }

    /// Installs a `JsonCodec` for `T`.
    pub fn register_json<T>(&self)
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.register(JsonCodec::<T>::new());
    }

    /// Appends a fallback factory.
    pub fn register_factory<F: CodecFactory>(&self, factory: F) {
        let mut factories = self.factories.write();
        let mut next = Vec::clone(&factories);
        next.push(Arc::new(factory));
        *factories = Arc::new(next);
    }

    /// Resolves the codec for `T`.
    pub fn get<T: 'static>(&self) -> Result<SharedCodec<T>, RabbitError> {
        let message_type = MessageType::of::<T>();

        if let Some(codec) = self
            .codecs
            .get(&message_type.id)
            .and_then(|entry| entry.downcast::<T>())
        {
            return Ok(codec);
        }

        let factories = self.factories.read().clone();
        for factory in factories.iter() {
            let Some(erased) = factory.create(&message_type) else {
                continue;
            };

            match erased.downcast::<T>() {
                Some(codec) => return Ok(codec),
                None => warn!(
                    requested = message_type.name,
                    produced = erased.message_type.name,
                    "codec factory produced a codec for another type"
                ),
            }
        }

        Err(RabbitError::NoCodec {
            type_name: message_type.name,
        })
    }

    /// Whether a codec is registered directly for `T`.
    pub fn contains<T: 'static>(&self) -> bool {
        self.codecs.contains_key(&TypeId::of::<T>())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.codecs.len())
            .field("factories", &self.factories.read().len())
            .finish()
    }
}
