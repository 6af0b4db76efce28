//! # Restart decision parameters for a runner.
//!
//! The decision tree on a child worker's death, in order:
//!
//! 1. `is_fatal(err)` — the worker is removed permanently; if additionally
//!    `kills_runner(err)`, the error becomes the runner's own terminal error.
//! 2. `should_restart(err)` — the worker is respawned under the same name
//!    after the backoff delay, using its original start function.
//! 3. otherwise — the worker is removed without restart.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::Error;
use crate::policy::BackoffPolicy;

/// Pure decision function over a worker's terminal error.
pub type ErrorPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Restart policy a [`Runner`](crate::Runner) is configured with.
#[derive(Clone)]
pub struct RestartParams {
    /// Stop retrying this worker, whatever `should_restart` says.
    pub is_fatal: ErrorPredicate,
    /// Respawn the worker after the backoff delay.
    pub should_restart: ErrorPredicate,
    /// A fatal child error that should take the whole runner down with it.
    /// Typically never: one broken child must not kill the controller
    /// process.
    pub kills_runner: ErrorPredicate,
    /// Delay curve between a worker's death and its respawn.
    pub backoff: BackoffPolicy,
}

impl Default for RestartParams {
    /// Nothing is fatal, everything restarts after one second.
    fn default() -> Self {
        Self {
            is_fatal: Arc::new(|_| false),
            should_restart: Arc::new(|_| true),
            kills_runner: Arc::new(|_| false),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RestartParams {
    /// Default policy with a flat restart delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            backoff: BackoffPolicy::constant(delay),
            ..Self::default()
        }
    }

    /// Replaces the fatal predicate.
    pub fn fatal_if(mut self, pred: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.is_fatal = Arc::new(pred);
        self
    }

    /// Replaces the restart predicate.
    pub fn restart_if(mut self, pred: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.should_restart = Arc::new(pred);
        self
    }

    /// Replaces the runner-fatal predicate.
    pub fn runner_fatal_if(
        mut self,
        pred: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.kills_runner = Arc::new(pred);
        self
    }
}
