// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod teardown;

#[cfg(test)]
mod test_support;

pub mod amqp;
pub mod broker;
pub mod builder;
pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod rabbit;
pub mod registry;
pub mod subscription;

pub use rabbit::Rabbit;
