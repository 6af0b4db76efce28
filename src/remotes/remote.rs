//! Per-target connection state and its supervising worker.
//!
//! A [`RemoteConnection`] is the long-lived handle for one remote
//! controller: it survives restarts of the [`RemoteServer`] worker behind
//! it, so consumers (presence trackers, reconciliation) keep a stable view
//! while the transport connection below comes and goes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catacomb::{Catacomb, Plan, Worker};
use crate::errors::Error;
use crate::runner::StartFn;

/// Live transport connection to a remote controller.
pub trait Connection: Send + Sync + 'static {
    /// Liveness check; `true` once the connection is no longer usable.
    fn is_broken(&self) -> bool;

    /// Token cancelled when the transport reports the connection broken.
    fn broken(&self) -> CancellationToken;
}

/// Opens transport connections. Injected so tests (and alternative
/// transports) can substitute their own.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        controller_id: &str,
        addrs: &[String],
    ) -> Result<Box<dyn Connection>, Error>;
}

type Conn = Arc<dyn Connection>;

struct RemoteState {
    controller_id: Arc<str>,
    addrs: watch::Sender<Vec<String>>,
    conn: watch::Sender<Option<Conn>>,
}

/// Stable per-target handle: current addresses, connection-open predicate,
/// and a way to wait for a live connection. Cheap to clone.
#[derive(Clone)]
pub struct RemoteConnection {
    state: Arc<RemoteState>,
}

impl RemoteConnection {
    pub fn new(controller_id: &str, addrs: Vec<String>) -> Self {
        Self {
            state: Arc::new(RemoteState {
                controller_id: Arc::from(controller_id),
                addrs: watch::Sender::new(addrs),
                conn: watch::Sender::new(None),
            }),
        }
    }

    pub fn controller_id(&self) -> &str {
        &self.state.controller_id
    }

    /// Replaces the target's addresses in place. An established connection
    /// is kept; the new addresses apply from the next (re)connect on.
    pub fn update_addrs(&self, addrs: Vec<String>) {
        self.state.addrs.send_replace(addrs);
    }

    pub fn addrs(&self) -> Vec<String> {
        self.state.addrs.borrow().clone()
    }

    /// Whether a transport connection is currently established.
    pub fn is_open(&self) -> bool {
        self.state.conn.borrow().is_some()
    }

    /// Waits until a live connection is available. [`Error::Aborted`] when
    /// `abort` fires first.
    pub async fn connection(&self, abort: &CancellationToken) -> Result<Conn, Error> {
        let mut rx = self.state.conn.subscribe();
        loop {
            if let Some(conn) = rx.borrow_and_update().clone() {
                return Ok(conn);
            }
            tokio::select! {
                res = rx.changed() => res.map_err(|_| Error::Dead)?,
                _ = abort.cancelled() => {
                    return Err(Error::Aborted(format!(
                        "waiting for connection to controller {}",
                        self.state.controller_id
                    )));
                }
            }
        }
    }

    pub fn report(&self) -> Map<String, Value> {
        let mut report = Map::new();
        report.insert("controller-id".into(), json!(&*self.state.controller_id));
        report.insert("connected".into(), json!(self.is_open()));
        report.insert("addresses".into(), json!(self.addrs()));
        report
    }

    #[cfg(test)]
    pub(crate) fn inject_connection(&self, conn: Option<Conn>) {
        self.state.conn.send_replace(conn);
    }
}

/// Worker owning one transport connection lifetime for its target.
///
/// One incarnation covers exactly one connection: it connects, publishes the
/// connection into the shared [`RemoteConnection`] state, and terminates
/// with [`Error::BrokenConnection`] once the transport reports it broken —
/// the owning runner's restart policy brings the next incarnation up after
/// its delay.
pub struct RemoteServer {
    catacomb: Catacomb,
    remote: RemoteConnection,
}

impl RemoteServer {
    pub fn new(remote: RemoteConnection, connector: Arc<dyn Connector>) -> Self {
        let state = remote.clone();
        let catacomb = Catacomb::launch(Plan::new(
            format!("remote-{}", remote.controller_id()),
            move |dying| serve(state, connector, dying),
        ));
        Self { catacomb, remote }
    }

    /// Start function for a runner, reusable across restarts.
    pub fn start_fn(remote: RemoteConnection, connector: Arc<dyn Connector>) -> StartFn {
        Arc::new(move |_token| {
            let remote = remote.clone();
            let connector = connector.clone();
            Box::pin(async move {
                Ok(Box::new(RemoteServer::new(remote, connector)) as Box<dyn Worker>)
            })
        })
    }
}

#[async_trait]
impl Worker for RemoteServer {
    fn kill(&self) {
        self.catacomb.kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        self.catacomb.wait().await
    }

    fn report(&self) -> Map<String, Value> {
        self.remote.report()
    }
}

async fn serve(
    remote: RemoteConnection,
    connector: Arc<dyn Connector>,
    dying: CancellationToken,
) -> Result<(), Error> {
    let controller_id = remote.state.controller_id.clone();

    // A target can momentarily have no addresses; wait rather than spinning
    // through connect failures.
    let mut addr_rx = remote.state.addrs.subscribe();
    let addrs = loop {
        let addrs = addr_rx.borrow_and_update().clone();
        if !addrs.is_empty() {
            break addrs;
        }
        tokio::select! {
            res = addr_rx.changed() => res.map_err(|_| Error::Dead)?,
            _ = dying.cancelled() => return Ok(()),
        }
    };

    let conn = tokio::select! {
        res = connector.connect(&controller_id, &addrs) => res?,
        _ = dying.cancelled() => return Ok(()),
    };
    let conn: Conn = Arc::from(conn);
    if conn.is_broken() {
        warn!(controller = %controller_id, "connection broken at first liveness check");
        return Err(Error::BrokenConnection);
    }

    remote.state.conn.send_replace(Some(conn.clone()));
    info!(controller = %controller_id, "connected to remote controller");

    let broken = conn.broken();
    let result = tokio::select! {
        _ = broken.cancelled() => {
            warn!(controller = %controller_id, "connection to remote controller broken");
            Err(Error::BrokenConnection)
        }
        _ = dying.cancelled() => Ok(()),
    };
    remote.state.conn.send_replace(None);
    result
}
