//! # Core worker contract.
//!
//! A [`Worker`] is a unit of concurrent work that was started at construction
//! time and can be asked to stop. `kill` is an idempotent, non-blocking stop
//! request; `wait` is the join point and returns the terminal error, if any.
//!
//! After `wait` returns, no task owned by the worker is still running.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::errors::Error;

/// Asynchronous supervised worker.
///
/// Implementations usually delegate to a [`Catacomb`](crate::Catacomb) that
/// owns their tasks.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Requests the worker to stop. Idempotent, never blocks.
    fn kill(&self);

    /// Blocks until the worker has fully stopped and returns its terminal
    /// error. Callable from multiple tasks; every call observes the same
    /// outcome.
    async fn wait(&self) -> Result<(), Error>;

    /// Point-in-time introspection snapshot.
    ///
    /// Diagnostics only: keys are human-readable and not a stable API. Must
    /// not block.
    fn report(&self) -> Map<String, Value> {
        Map::new()
    }
}

#[async_trait]
impl<W: Worker + ?Sized> Worker for Arc<W> {
    fn kill(&self) {
        (**self).kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        (**self).wait().await
    }

    fn report(&self) -> Map<String, Value> {
        (**self).report()
    }
}
