//! # Fate-sharing worker supervision.
//!
//! A [`Catacomb`] ties a main work loop, a cancellable token, and a set of
//! sub-workers into one group with a single terminal error and a single join
//! point. If any member exits — the work loop for any reason, or a supervised
//! sub-worker with an error or not — the whole group transitions to dying,
//! the token is cancelled, every member is killed, and [`Catacomb::wait`]
//! returns the first error recorded.
//!
//! ```text
//! Plan { name, work, init } ──► Catacomb::launch()
//!         │
//!         ├──► spawn work(dying_token)          ┐
//!         ├──► supervise init[0].wait()         ├── one JoinSet
//!         └──► supervise init[N].wait()         ┘
//!
//! first member exit (or kill()):
//!         ├──► record first error (if any)
//!         ├──► cancel token, kill() remaining members
//!         └──► drain joins ──► dead ──► wait() returns
//! ```

mod group;
mod worker;

pub use group::{Catacomb, Plan};
pub use worker::Worker;
