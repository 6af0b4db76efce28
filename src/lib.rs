//! # warden
//!
//! **Warden** is a supervised-worker concurrency runtime for Rust.
//!
//! It provides the primitives to build long-running agents out of small
//! cooperating workers: fate-sharing groups, named worker pools with
//! restart policies, and declarative dependency wiring. The worked
//! examples (`remotes`, `presence`) show the primitives composed into a
//! real subsystem: one supervised connection per remote controller, with
//! liveness bookkeeping on top.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │   Manifold   │   │   Manifold   │   │   Manifold   │
//!  │ (inputs +    │   │ (inputs +    │   │ (inputs +    │
//!  │  start fn)   │   │  start fn)   │   │  start fn)   │
//!  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!         ▼                  ▼                  ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  Engine (dependency wiring)                             │
//! │  - resolves declared inputs through a Getter            │
//! │  - retries DependencyMissing until providers appear     │
//! │  - publishes started workers' outputs to dependents     │
//! └───────────────────────────┬─────────────────────────────┘
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  Runner (named worker pool)                             │
//! │  - single actor owns the name → record map              │
//! │  - RestartParams: is_fatal / should_restart / backoff   │
//! │  - report() aggregation that never blocks on a child    │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        ▼                  ▼                  ▼
//!     ┌──────────┐       ┌──────────┐       ┌──────────┐
//!     │ Catacomb │       │ Catacomb │       │ Catacomb │
//!     │ (worker) │       │ (worker) │       │ (worker) │
//!     └──────────┘       └──────────┘       └──────────┘
//! ```
//!
//! ### Lifecycle
//! ```text
//! Plan ──► Catacomb::launch ──► work loop + supervised members
//!
//! first member exit (error, completion, or kill)
//!   ├─► dying: CancellationToken cancelled
//!   ├─► every adopted worker killed
//!   ├─► remaining joins drained
//!   └─► wait() returns the first recorded error
//!
//! Runner child exit with error:
//!   ├─ is_fatal?        ─► remove permanently (maybe kill the runner)
//!   ├─ should_restart?  ─► wait out backoff, re-invoke the start fn
//!   └─ otherwise        ─► remove without restart
//! ```
//!
//! ## Features
//! | Area            | Description                                              | Key types / traits                      |
//! |-----------------|----------------------------------------------------------|-----------------------------------------|
//! | **Supervision** | Fate-sharing worker groups with one failure point.       | [`Catacomb`], [`Plan`], [`Worker`]      |
//! | **Pools**       | Dynamic named workers with restart policies.             | [`Runner`], [`RestartParams`]           |
//! | **Wiring**      | Compose workers from declared named dependencies.        | [`Manifold`], [`Engine`], [`Getter`]    |
//! | **Errors**      | One clonable taxonomy with kind predicates.              | [`Error`]                               |
//! | **Remotes**     | Reconciled per-target connections with fan-out.          | [`remotes::RemoteCallers`]              |
//! | **Presence**    | Per-connection liveness trackers with cleanup.           | [`presence::PresenceWorker`]            |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden::{Catacomb, Plan, RestartParams, Runner, StartFn, Worker};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), warden::Error> {
//!     // A pool that restarts failed workers after one second.
//!     let runner = Runner::new("demo", RestartParams::with_delay(Duration::from_secs(1)));
//!
//!     // A worker that idles until its group starts dying.
//!     let start: StartFn = Arc::new(|_token| {
//!         Box::pin(async {
//!             let worker = Catacomb::launch(Plan::new("ticker", |dying| async move {
//!                 dying.cancelled().await;
//!                 Ok(())
//!             }));
//!             Ok(Box::new(worker) as Box<dyn Worker>)
//!         })
//!     });
//!     runner.start_worker("ticker", start).await?;
//!
//!     runner.kill();
//!     runner.wait().await
//! }
//! ```

mod catacomb;
mod errors;
mod manifold;
mod policy;
mod runner;
mod services;

pub mod presence;
pub mod remotes;

// ---- Public re-exports ----

pub use catacomb::{Catacomb, Plan, Worker};
pub use errors::Error;
pub use manifold::{
    get_resource, Engine, EngineParams, Getter, Manifold, ManifoldStartFn, Output, StartedWorker,
};
pub use policy::{BackoffPolicy, ErrorPredicate, JitterPolicy, RestartParams};
pub use runner::{Runner, StartFn};
pub use services::{ControllerNodeService, DomainServices, NotifyWatcher, StatusService};
