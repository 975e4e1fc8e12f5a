// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codecs
//!
//! A codec turns a message type into bytes and back. This module provides the
//! `Codec` trait, the built-in JSON, UTF-8 and raw byte codecs, and the gzip
//! decorator that compresses whatever another codec produces.

use crate::errors::EncodingError;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::type_name,
    io::{Read, Write},
    marker::PhantomData,
    sync::Arc,
};

/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for UTF-8 text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for opaque payloads
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";
/// Content encoding set by the gzip decorator
pub const GZIP_CONTENT_ENCODING: &str = "gzip";

/// Paired encoder and decoder for messages of type `Message`.
pub trait Codec: Send + Sync + 'static {
    type Message: 'static;

    fn encode(&self, value: &Self::Message) -> Result<Vec<u8>, EncodingError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Message, EncodingError>;

    /// Content type stamped on published messages.
    fn content_type(&self) -> &str {
        BINARY_CONTENT_TYPE
    }

    /// Content encoding stamped on published messages, if any.
    fn content_encoding(&self) -> Option<&str> {
        None
    }
}

/// Shared handle to a codec, as stored in the registry.
pub type SharedCodec<T> = Arc<dyn Codec<Message = T>>;

/// Wraps `codec` so payloads are gzip compressed.
///
/// A codec that already produces gzip content is returned unchanged.
pub fn gzip<T: 'static>(codec: SharedCodec<T>) -> SharedCodec<T> {
    if codec.content_encoding() == Some(GZIP_CONTENT_ENCODING) {
        return codec;
    }

    Arc::new(GzipCodec { delegate: codec })
}

/// Decorator compressing the output of another codec.
pub struct GzipCodec<T> {
    delegate: SharedCodec<T>,
}

impl<T: 'static> Codec for GzipCodec<T> {
    type Message = T;

    fn encode(&self, value: &T) -> Result<Vec<u8>, EncodingError> {
        let encoded = self.delegate.encode(value)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&encoded)
            .map_err(EncodingError::Compress)?;
        encoder.finish().map_err(EncodingError::Compress)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, EncodingError> {
        let mut decompressed = vec![];
        GzDecoder::new(bytes)
            .read_to_end(&mut decompressed)
            .map_err(EncodingError::Decompress)?;

        self.delegate.decode(&decompressed)
    }

    fn content_type(&self) -> &str {
        self.delegate.content_type()
    }

    fn content_encoding(&self) -> Option<&str> {
        Some(GZIP_CONTENT_ENCODING)
    }
}

/// JSON codec backed by serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Message = T;

    fn encode(&self, value: &T) -> Result<Vec<u8>, EncodingError> {
        serde_json::to_vec(value).map_err(|err| EncodingError::Encode {
            type_name: type_name::<T>(),
            reason: err.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, EncodingError> {
        serde_json::from_slice(bytes).map_err(|err| EncodingError::Decode {
            type_name: type_name::<T>(),
            reason: err.to_string(),
        })
    }

    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }
}

/// Codec for `String` payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    type Message = String;

    fn encode(&self, value: &String) -> Result<Vec<u8>, EncodingError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, EncodingError> {
        String::from_utf8(bytes.to_vec()).map_err(|err| EncodingError::Decode {
            type_name: type_name::<String>(),
            reason: err.to_string(),
        })
    }

    fn content_type(&self) -> &str {
        TEXT_CONTENT_TYPE
    }
}

/// Pass-through codec for raw `Vec<u8>` payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Message = Vec<u8>;

    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, EncodingError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
        Ok(bytes.to_vec())
    }
}
