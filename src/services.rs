//! Domain collaborator contracts.
//!
//! The runtime does no domain work of its own; these narrow interfaces are
//! what its workers call into. Implementations must be safe for concurrent
//! use by multiple workers — the runtime adds no locking around them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Error;

/// Emits a unit notification for every change of the thing it watches.
///
/// Notifications carry no payload; consumers re-read the source of truth on
/// each tick. `next` returning `None` means the watcher has stopped for good.
#[async_trait]
pub trait NotifyWatcher: Send + 'static {
    async fn next(&mut self) -> Option<()>;
}

/// Source of truth for controller API addresses.
#[async_trait]
pub trait ControllerNodeService: Send + Sync + 'static {
    /// Current API addresses keyed by controller ID. An empty map is a valid,
    /// transient state.
    async fn api_addresses_by_controller(&self) -> Result<HashMap<String, Vec<String>>, Error>;

    /// Watcher that ticks whenever the address map may have changed.
    async fn watch_api_addresses(&self) -> Result<Box<dyn NotifyWatcher>, Error>;
}

/// Presence record bookkeeping for machines and units.
///
/// Both deletes must treat "no such record" as a no-op, not an error: a
/// broken connection is routinely reported more than once across restarts.
#[async_trait]
pub trait StatusService: Send + Sync + 'static {
    async fn delete_machine_presence(&self, machine: &str) -> Result<(), Error>;

    async fn delete_unit_presence(&self, unit: &str) -> Result<(), Error>;
}

/// Aggregate published under the domain services manifold name. Workers pull
/// out only the narrow service they consume.
pub trait DomainServices: Send + Sync + 'static {
    fn controller_node(&self) -> Arc<dyn ControllerNodeService>;

    fn status(&self) -> Arc<dyn StatusService>;
}
