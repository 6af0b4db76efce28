//! # Manifolds: declarative, dependency-wired worker construction.
//!
//! A [`Manifold`] names the inputs a worker depends on and carries a start
//! function that resolves those inputs through a [`Getter`] before
//! constructing the worker. The [`Engine`] holds a set of named manifolds and
//! keeps retrying each start until its inputs become available, so process
//! composition is driven purely by the declared dependency graph rather than
//! wall-clock start order.
//!
//! ## Rules
//! - A start function validates its own config first and fails closed with a
//!   not-valid error before any construction.
//! - "Dependency not ready" ([`Error::DependencyMissing`](crate::Error))
//!   propagates unchanged; the engine alone decides retry and backoff.
//! - Requesting an input a manifold did not declare is a programming error
//!   and is rejected outright.

mod engine;
mod wiring;

pub use engine::{Engine, EngineParams};
pub use wiring::{get_resource, Getter, Manifold, ManifoldStartFn, Output, StartedWorker};
