// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Executors
//!
//! Every broker operation is one unit of work scheduled on an `Executor`; the
//! caller receives a `Pending` future resolving with the unit's result.

use crate::errors::RabbitError;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    runtime::{Handle, Runtime},
    task::JoinHandle,
};
use tracing::debug;

/// Where scheduled operations run.
#[derive(Clone)]
pub enum Executor {
    /// A runtime owned by the caller
    Handle(Handle),
    /// A runtime owned by the client, shut down when it closes
    Dedicated(Arc<DedicatedRuntime>),
    /// Runs the work on the task awaiting its `Pending`
    Direct,
}

impl Executor {
    /// The runtime the caller is running on.
    pub fn current() -> Result<Self, RabbitError> {
        Handle::try_current()
            .map(Executor::Handle)
            .map_err(|err| RabbitError::Executor(err.to_string()))
    }

    /// A multi-thread runtime owned exclusively by the client.
    pub fn dedicated(workers: usize) -> Result<Self, RabbitError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("thumper-worker")
            .enable_all()
            .build()
            .map_err(|err| RabbitError::Executor(err.to_string()))?;

        Ok(Executor::Dedicated(Arc::new(DedicatedRuntime {
            runtime: Mutex::new(Some(runtime)),
        })))
    }

    /// Whether the client must shut this executor down on close.
    pub fn is_owned(&self) -> bool {
        matches!(self, Executor::Dedicated(_))
    }

    pub(crate) fn spawn<R, F>(&self, work: F) -> Pending<R>
    where
        F: Future<Output = Result<R, RabbitError>> + Send + 'static,
        R: Send + 'static,
    {
        match self {
            Executor::Handle(handle) => Pending::spawned(handle.spawn(work)),
            Executor::Dedicated(runtime) => match runtime.handle() {
                Some(handle) => Pending::spawned(handle.spawn(work)),
                None => Pending::failed(RabbitError::Closed),
            },
            Executor::Direct => Pending::inline(Box::pin(work)),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Executor::Dedicated(runtime) = self {
            runtime.shutdown();
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Handle(_) => f.write_str("Executor::Handle"),
            Executor::Dedicated(_) => f.write_str("Executor::Dedicated"),
            Executor::Direct => f.write_str("Executor::Direct"),
        }
    }
}

/// A tokio runtime the client owns.
pub struct DedicatedRuntime {
    runtime: Mutex<Option<Runtime>>,
}

impl DedicatedRuntime {
    fn handle(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.handle().clone())
    }

    fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            debug!("shutting down dedicated runtime");
            runtime.shutdown_background();
        }
    }
}

impl Drop for DedicatedRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Result of a scheduled operation.
///
/// Work handed to a runtime starts immediately; awaiting only collects the
/// outcome. Work on `Executor::Direct` runs while being awaited.
#[must_use = "dropping a Pending discards the operation's outcome"]
pub struct Pending<R> {
    state: PendingState<R>,
}

enum PendingState<R> {
    Spawned(JoinHandle<Result<R, RabbitError>>),
    Inline(BoxFuture<'static, Result<R, RabbitError>>),
    Ready(Option<Result<R, RabbitError>>),
}

impl<R> Pending<R> {
    fn spawned(handle: JoinHandle<Result<R, RabbitError>>) -> Self {
        Pending {
            state: PendingState::Spawned(handle),
        }
    }

    fn inline(work: BoxFuture<'static, Result<R, RabbitError>>) -> Self {
        Pending {
            state: PendingState::Inline(work),
        }
    }

    pub(crate) fn failed(err: RabbitError) -> Self {
        Pending {
            state: PendingState::Ready(Some(Err(err))),
        }
    }
}

// `R` is only ever moved out, never pinned.
impl<R> Unpin for Pending<R> {}

impl<R> Future for Pending<R> {
    type Output = Result<R, RabbitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Spawned(handle) => Pin::new(handle).poll(cx).map(|joined| {
                joined.unwrap_or_else(|err| Err(RabbitError::Executor(err.to_string())))
            }),
            PendingState::Inline(work) => work.as_mut().poll(cx),
            PendingState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(RabbitError::Executor("operation polled after completion".to_owned()))
            })),
        }
    }
}

/// Bounds `work` by `deadline` when one is configured.
pub(crate) async fn with_deadline<R, F>(deadline: Option<Duration>, work: F) -> Result<R, RabbitError>
where
    F: Future<Output = Result<R, RabbitError>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| RabbitError::Timeout(limit))?,
        None => work.await,
    }
}
