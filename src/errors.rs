// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy of the client. `RabbitError` is the
//! error every public operation completes with; `BrokerError` wraps failures of
//! the underlying transport, `EncodingError` failures of codecs, and
//! `CompositeError` aggregates the independent failures of a teardown.

use std::{fmt, time::Duration};
use thiserror::Error;

/// Boxed error returned by user supplied consumers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by the broker transport.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error raised by the AMQP client library
    #[error(transparent)]
    Amqp(#[from] lapin::Error),

    /// The channel was already closed when the operation was issued
    #[error("channel `{0}` is closed")]
    ChannelClosed(u16),

    /// The connection was already closed when the operation was issued
    #[error("connection is closed")]
    ConnectionClosed,

    /// Any other transport failure
    #[error("{0}")]
    Other(String),
}

/// Failures raised while encoding or decoding a message payload.
#[derive(Error, Debug)]
pub enum EncodingError {
    /// The value could not be turned into bytes
    #[error("failure to encode `{type_name}`: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },

    /// The payload could not be turned into a value
    #[error("failure to decode `{type_name}`: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },

    /// Compressing the encoded payload failed
    #[error("failure to compress payload: {0}")]
    Compress(#[source] std::io::Error),

    /// Decompressing the received payload failed
    #[error("failure to decompress payload: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Represents errors that can occur during client operations.
///
/// Each variant carries the context of the operation that failed. Transport
/// causes are kept as sources so they show up in error chains.
#[derive(Error, Debug)]
pub enum RabbitError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    Connection(#[source] BrokerError),

    /// A channel could not be created or borrowed
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(#[source] BrokerError),

    /// The channel pool rejected the borrow
    #[error("channel pool failure: {0}")]
    Pool(String),

    /// No codec is registered, directly or through a factory, for the type
    #[error("no codec registered for type `{type_name}`")]
    NoCodec { type_name: &'static str },

    /// Encoding or decoding a payload failed
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{name}`: {source}")]
    DeclareExchange { name: String, source: BrokerError },

    /// Error deleting an exchange with the given name
    #[error("failure to delete exchange `{name}`: {source}")]
    DeleteExchange { name: String, source: BrokerError },

    /// Error declaring a queue
    #[error("failure to declare queue `{name}`: {source}")]
    DeclareQueue { name: String, source: BrokerError },

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{queue}` to exchange `{exchange}` with key `{routing_key}`: {source}")]
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
        source: BrokerError,
    },

    /// Error deleting a queue
    #[error("failure to delete queue `{name}`: {source}")]
    DeleteQueue { name: String, source: BrokerError },

    /// Error publishing a message
    #[error("failure to publish to exchange `{exchange}`: {source}")]
    Publish { exchange: String, source: BrokerError },

    /// Error registering a consumer on a queue
    #[error("failure to consume queue `{queue}`: {source}")]
    Consume { queue: String, source: BrokerError },

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{consumer_tag}`: {source}")]
    Cancel {
        consumer_tag: String,
        source: BrokerError,
    },

    /// Error closing a channel or connection during teardown
    #[error("failure to close {what}: {source}")]
    Close {
        what: &'static str,
        source: BrokerError,
    },

    /// The client has begun teardown and accepts no further operations
    #[error("client is closed")]
    Closed,

    /// The operation did not complete within the configured deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The executor failed to run the scheduled operation
    #[error("executor failure: {0}")]
    Executor(String),

    /// One or more independent teardown steps failed
    #[error(transparent)]
    Composite(#[from] CompositeError),
}

/// Aggregation of the failures collected by a teardown.
///
/// Nested composites are flattened, so `causes` always lists leaf failures in
/// the order their steps ran.
#[derive(Debug)]
pub struct CompositeError {
    causes: Vec<RabbitError>,
}

impl CompositeError {
    pub(crate) fn new(causes: Vec<RabbitError>) -> Self {
        let mut flat = Vec::with_capacity(causes.len());
        for cause in causes {
            match cause {
                RabbitError::Composite(nested) => flat.extend(nested.causes),
                other => flat.push(other),
            }
        }

        CompositeError { causes: flat }
    }

    /// The failures, in the order their teardown steps ran.
    pub fn causes(&self) -> &[RabbitError] {
        &self.causes
    }

    pub fn into_causes(self) -> Vec<RabbitError> {
        self.causes
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cause in &self.causes {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{cause}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes
            .first()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Failures of a single delivery, reported instead of being raised inside the
/// delivery callback.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The payload could not be decoded into the subscribed type
    #[error("failure to decode delivery: {0}")]
    Decode(#[source] EncodingError),

    /// The consumer returned an error
    #[error("consumer failure: {0}")]
    Consumer(#[source] BoxError),

    /// The delivery could not be acknowledged
    #[error("failure to ack delivery: {0}")]
    Ack(#[source] BrokerError),

    /// The delivery could not be rejected
    #[error("failure to nack delivery: {0}")]
    Nack(#[source] BrokerError),

    /// The consumer panicked while handling the delivery
    #[error("consumer panicked: {0}")]
    Panicked(String),

    /// The subscription lost its channel and could not be registered again
    #[error("subscription could not be recovered: {0}")]
    Recovery(#[source] Box<RabbitError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_message_lists_every_cause() {
        let err = CompositeError::new(vec![
            RabbitError::Closed,
            RabbitError::NoCodec { type_name: "u8" },
        ]);

        let msg = err.to_string();
        assert!(msg.contains("client is closed"));
        assert!(msg.contains("no codec registered for type `u8`"));
        assert_eq!(msg.lines().count(), 2);
    }

    #[test]
    fn nested_composites_are_flattened() {
        let inner = CompositeError::new(vec![RabbitError::Closed, RabbitError::Closed]);
        let outer = CompositeError::new(vec![
            RabbitError::Composite(inner),
            RabbitError::Timeout(Duration::from_secs(1)),
        ]);

        assert_eq!(outer.causes().len(), 3);
        assert!(matches!(outer.causes()[2], RabbitError::Timeout(_)));
    }
}
