//! # Runner: a named, restart-capable pool of supervised workers.
//!
//! A [`Runner`] tracks a dynamic set of workers under unique names. When a
//! tracked worker dies, the runner consults its [`RestartParams`] and either
//! removes it permanently or respawns it under the same name after a backoff
//! delay, using the original start function.
//!
//! ## Architecture
//! ```text
//! start_worker / stop_and_remove_worker / worker  (public, any task)
//!        │ commands over mpsc
//!        ▼
//!   pool actor (single serialization point, owns name → record map)
//!        ├─► starter task   ── Started{name, result}
//!        ├─► monitor task   ── Done{name, result}      (one per live child)
//!        └─► restart timer  ── RestartDue{name}
//! ```
//!
//! ## Rules
//! - Names are unique while tracked; `start_worker` on a live name returns
//!   [`Error::AlreadyExists`](crate::Error::AlreadyExists).
//! - All registry mutation happens on the actor; reads (`worker_names`,
//!   `report`) come from a shared snapshot and never block on a child.
//! - A name stays tracked across the whole fail → delay → respawn cycle.
//! - Killing the runner kills and joins every tracked worker before
//!   `wait` returns.

mod pool;

pub use pool::{Runner, StartFn};
