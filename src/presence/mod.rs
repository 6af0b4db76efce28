//! # Controller presence: liveness bookkeeping per remote controller.
//!
//! The [`PresenceWorker`] subscribes to the remote set maintained by the
//! API remote caller and keeps one [`ConnectionTracker`] per remote. Each
//! tracker watches its connection and, once the connection is confirmed
//! broken, removes the controller's machine and unit presence records
//! before terminating so the runner can restart it for the next connection.

mod manifold;
mod tracker;
mod worker;

pub use manifold::{default_new_worker, manifold, ManifoldConfig, NewPresenceWorkerFn};
pub use tracker::ConnectionTracker;
pub use worker::{PresenceConfig, PresenceWorker};
