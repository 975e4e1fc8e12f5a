// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Teardown Aggregation
//!
//! Closing a resource fans out into several independent steps (children,
//! channels, the connection). A `Teardown` runs every step in registration
//! order regardless of earlier failures and reports the failures together.
//!
//! Policy: success when no step failed, otherwise always a
//! `RabbitError::Composite`, even for a single failure.

use crate::errors::{CompositeError, RabbitError};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::{future::Future, hash::Hash};
use tracing::error;

/// Ordered list of fallible teardown steps.
#[derive(Default)]
pub struct Teardown<'a> {
    steps: Vec<(&'static str, BoxFuture<'a, Result<(), RabbitError>>)>,
}

impl<'a> Teardown<'a> {
    pub fn new() -> Self {
        Teardown { steps: vec![] }
    }

    /// Appends a step. Steps are lazy and only run inside `execute`.
    pub fn add<F>(&mut self, label: &'static str, step: F)
    where
        F: Future<Output = Result<(), RabbitError>> + Send + 'a,
    {
        self.steps.push((label, Box::pin(step)));
    }

    /// Runs every step, then fails with the collected failures if any.
    pub async fn execute(self) -> Result<(), RabbitError> {
        let mut failures = vec![];

        for (label, step) in self.steps {
            if let Err(err) = step.await {
                error!(error = err.to_string(), step = label, "teardown step failed");
                failures.push(err);
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        Err(RabbitError::Composite(CompositeError::new(failures)))
    }
}

/// Tracks the closes of a live set's members that are still running.
///
/// A member holds a pass for its whole close, taken before it leaves the
/// set. The owner settles the gate after closing the members it drained, so
/// it never moves on while a member removed by a concurrent close is still
/// tearing down.
#[derive(Default)]
pub(crate) struct CloseGate {
    lock: tokio::sync::RwLock<()>,
}

impl CloseGate {
    pub(crate) async fn enter(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Waits until no member close holds a pass.
    pub(crate) async fn settle(&self) {
        drop(self.lock.write().await);
    }
}

/// Removes every entry of `map` and returns the removed values.
///
/// Keys are snapshotted first and removed one by one, so each value is
/// handed to exactly one caller even when several drain or remove at once.
pub(crate) fn drain<K, V>(map: &DashMap<K, V>) -> Vec<V>
where
    K: Eq + Hash + Clone,
{
    let keys: Vec<K> = map.iter().map(|entry| entry.key().clone()).collect();

    keys.into_iter()
        .filter_map(|key| map.remove(&key).map(|(_, value)| value))
        .collect()
}
