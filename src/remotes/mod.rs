//! # API remote caller: one supervised connection per remote controller.
//!
//! The [`RemoteCallers`] worker watches the controller API address source and
//! keeps a [`Runner`](crate::Runner) holding one [`RemoteServer`] worker per
//! remote controller. On every address change it reconciles the desired
//! target set against the runner, updates surviving targets' addresses in
//! place (live connections are not torn down over metadata), and fans a unit
//! notification out to every registered [`Subscription`].
//!
//! ```text
//!  ControllerNodeService ── watcher tick ──► RemoteCallers event loop
//!                                              ├── reconcile: Runner{controller-N → RemoteServer}
//!                                              ├── update_addrs on survivors
//!                                              └── notify ──► [sub 1] [sub 2] ... (coalescing)
//! ```

mod caller;
mod manifold;
mod remote;

pub use caller::{ApiRemotes, RemoteCallers, RemoteCallersConfig, Subscription};
pub use manifold::{default_new_worker, manifold, ManifoldConfig, NewRemoteCallersFn};
pub use remote::{Connection, Connector, RemoteConnection, RemoteServer};

/// Runner name for a remote controller target.
pub(crate) fn target_name(controller_id: &str) -> String {
    format!("controller-{controller_id}")
}
