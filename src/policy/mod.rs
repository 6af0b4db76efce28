//! # Restart policy: mechanism-free decisions about worker failure.
//!
//! A [`Runner`](crate::Runner) never decides on its own whether a dead child
//! comes back. [`RestartParams`] injects that decision as three pure
//! predicates over [`Error`](crate::Error) plus a [`BackoffPolicy`] that
//! shapes the delay before the respawn.

mod backoff;
mod restart;

pub use backoff::{BackoffPolicy, JitterPolicy};
pub use restart::{ErrorPredicate, RestartParams};
