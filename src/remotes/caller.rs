//! The address-watching caller worker and its subscription surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::remote::{Connector, RemoteConnection, RemoteServer};
use super::target_name;
use crate::catacomb::{Catacomb, Plan, Worker};
use crate::errors::Error;
use crate::policy::RestartParams;
use crate::runner::Runner;
use crate::services::ControllerNodeService;

enum Msg {
    Subscribe {
        reply: oneshot::Sender<(u64, mpsc::Receiver<()>)>,
    },
    Unsubscribe {
        id: u64,
    },
    GetRemotes {
        reply: oneshot::Sender<Vec<RemoteConnection>>,
    },
}

/// Handle onto the remote set, for workers that track it.
#[async_trait]
pub trait ApiRemotes: Send + Sync + 'static {
    /// Registers for change notifications. The subscription also receives one
    /// notification for the state current at registration time.
    async fn subscribe(&self) -> Result<Subscription, Error>;

    /// Current remotes, sorted by controller ID.
    async fn get_api_remotes(&self) -> Result<Vec<RemoteConnection>, Error>;
}

/// One registered listener. Notifications are unit values and coalesce: a
/// subscriber that has not drained its pending notification gets no second
/// one queued behind it. Dropping the subscription unregisters it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<()>,
    unsub: mpsc::UnboundedSender<Msg>,
}

impl Subscription {
    /// Next change notification; `None` once the caller worker has died.
    pub async fn changes(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.unsub.send(Msg::Unsubscribe { id: self.id });
    }
}

/// Caller worker configuration.
#[derive(Clone)]
pub struct RemoteCallersConfig {
    pub controller_node_service: Arc<dyn ControllerNodeService>,
    pub connector: Arc<dyn Connector>,
    /// Restart delay for per-target connection workers.
    pub restart_delay: Duration,
}

impl RemoteCallersConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.restart_delay.is_zero() {
            return Err(Error::NotValid("restart delay of zero".into()));
        }
        Ok(())
    }
}

/// Worker maintaining one supervised connection per remote controller.
///
/// Owns a [`Runner`] as an init member of its catacomb: the runner's death
/// kills the caller and vice versa. The event loop serializes address ticks
/// against subscription bookkeeping, so subscribers observe a consistent
/// remote set.
pub struct RemoteCallers {
    catacomb: Catacomb,
    tx: mpsc::UnboundedSender<Msg>,
    runner: Arc<Runner>,
}

impl RemoteCallers {
    pub fn new(config: RemoteCallersConfig) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let runner = Runner::new("api-remotes", RestartParams::with_delay(config.restart_delay));
        let (tx, rx) = mpsc::unbounded_channel();

        let loop_runner = runner.clone();
        let catacomb = Catacomb::launch(
            Plan::new("api-remote-caller", move |dying| {
                CallerLoop {
                    config,
                    runner: loop_runner,
                    remotes: HashMap::new(),
                    subscribers: HashMap::new(),
                    next_sub: 0,
                    dying,
                }
                .run(rx)
            })
            .with_init(Box::new(runner.clone())),
        );

        Ok(Arc::new(Self { catacomb, tx, runner }))
    }

    fn send(&self, msg: Msg) -> Result<(), Error> {
        self.tx.send(msg).map_err(|_| Error::Dead)
    }
}

#[async_trait]
impl ApiRemotes for RemoteCallers {
    async fn subscribe(&self) -> Result<Subscription, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Subscribe { reply })?;
        let (id, changes) = rx.await.map_err(|_| Error::Dead)?;
        Ok(Subscription {
            id,
            rx: changes,
            unsub: self.tx.clone(),
        })
    }

    async fn get_api_remotes(&self) -> Result<Vec<RemoteConnection>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::GetRemotes { reply })?;
        rx.await.map_err(|_| Error::Dead)
    }
}

#[async_trait]
impl Worker for RemoteCallers {
    fn kill(&self) {
        self.catacomb.kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        self.catacomb.wait().await
    }

    fn report(&self) -> Map<String, Value> {
        let mut report = self.catacomb.report();
        report.insert("remotes".into(), Value::Object(self.runner.report()));
        report
    }
}

struct CallerLoop {
    config: RemoteCallersConfig,
    runner: Arc<Runner>,
    remotes: HashMap<String, RemoteConnection>,
    subscribers: HashMap<u64, mpsc::Sender<()>>,
    next_sub: u64,
    dying: CancellationToken,
}

impl CallerLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) -> Result<(), Error> {
        let mut watcher = self
            .config
            .controller_node_service
            .watch_api_addresses()
            .await?;

        // Reconcile once against the current state; the watcher only promises
        // ticks for changes after this point.
        self.tick().await.or_else(|err| self.stopped(err))?;

        loop {
            tokio::select! {
                _ = self.dying.cancelled() => return Ok(()),
                changed = watcher.next() => match changed {
                    Some(()) => self.tick().await.or_else(|err| self.stopped(err))?,
                    None => {
                        return Err(Error::Worker(
                            "api address watcher stopped unexpectedly".into(),
                        ));
                    }
                },
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => return Ok(()),
                },
            }
        }
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Subscribe { reply } => {
                let id = self.next_sub;
                self.next_sub += 1;
                let (tx, changes) = mpsc::channel(1);
                // Prime with the current state so a late subscriber does not
                // have to wait for the next address change.
                let _ = tx.try_send(());
                self.subscribers.insert(id, tx);
                let _ = reply.send((id, changes));
            }
            Msg::Unsubscribe { id } => {
                self.subscribers.remove(&id);
            }
            Msg::GetRemotes { reply } => {
                let mut remotes: Vec<RemoteConnection> = self.remotes.values().cloned().collect();
                remotes.sort_by(|a, b| a.controller_id().cmp(b.controller_id()));
                let _ = reply.send(remotes);
            }
        }
    }

    /// A kill can land while a tick is blocked inside the runner; the abort
    /// it produces is a clean stop, not a failure.
    fn stopped(&self, err: Error) -> Result<(), Error> {
        match err {
            Error::Aborted(_) if self.dying.is_cancelled() => Ok(()),
            err => Err(err),
        }
    }

    /// One watcher tick: re-read the address map, reconcile, notify.
    async fn tick(&mut self) -> Result<(), Error> {
        let desired = self
            .config
            .controller_node_service
            .api_addresses_by_controller()
            .await?;
        if desired.is_empty() {
            // Transient during controller reconfiguration; tearing the remote
            // set down over it would sever every live connection for nothing.
            warn!("api address map is empty; keeping current remotes");
            return Ok(());
        }
        self.reconcile(desired).await?;
        self.notify();
        Ok(())
    }

    /// Aligns the runner's target set with `desired`. Removals run before
    /// additions; surviving targets only get their addresses refreshed, so
    /// live connections are not torn down over metadata. Best-effort: a
    /// failure aborts the tick mid-way with no rollback, leaving the rest for
    /// the next tick or a restart.
    async fn reconcile(&mut self, desired: HashMap<String, Vec<String>>) -> Result<(), Error> {
        let gone: Vec<String> = self
            .remotes
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            match self
                .runner
                .stop_and_remove_worker(&target_name(&id), &self.dying)
                .await
            {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            self.remotes.remove(&id);
            info!(controller = %id, "removed remote controller target");
        }

        for (id, addrs) in desired {
            if let Some(remote) = self.remotes.get(&id) {
                remote.update_addrs(addrs);
                continue;
            }
            let remote = RemoteConnection::new(&id, addrs);
            let start = RemoteServer::start_fn(remote.clone(), self.config.connector.clone());
            match self.runner.start_worker(&target_name(&id), start).await {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
            self.remotes.insert(id.clone(), remote);
            info!(controller = %id, "added remote controller target");
        }
        Ok(())
    }

    /// Fans a unit notification out to every subscriber. `try_send` on a
    /// capacity-1 queue coalesces for slow consumers; a closed queue means
    /// the subscriber is gone.
    fn notify(&mut self) {
        self.subscribers.retain(|id, tx| match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!(subscriber = %id, "dropping closed subscription");
                false
            }
        });
    }
}
