//! # The fate-sharing group itself.
//!
//! [`Catacomb::launch`] spawns the plan's work loop and one supervision task
//! per member in a single [`JoinSet`]. The first member to exit — for any
//! reason — moves the group to dying: the token is cancelled, every adopted
//! worker is killed, and the remaining joins are drained. The first non-nil
//! error observed (from a member, a panic, or [`Catacomb::kill_with`]) is the
//! group's terminal error.
//!
//! ## Rules
//! - `kill` is idempotent; the first recorded reason wins.
//! - `wait` only returns once **all** members have joined.
//! - Panics in members are not recovered; they surface as an opaque worker
//!   error through `wait`.
//! - Adoption after the group started dying fails with [`Error::Dead`] and
//!   the rejected worker is killed so it cannot leak.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::worker::Worker;
use crate::errors::Error;

type WorkFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// Description of a fate-sharing group: a name, a main work loop, and the
/// sub-workers that must be supervised from the start.
pub struct Plan {
    name: String,
    work: WorkFn,
    init: Vec<Box<dyn Worker>>,
}

impl Plan {
    /// Creates a plan around a work closure. The closure receives the
    /// group's dying token and must select on it in all blocking operations.
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Box::new(move |token| Box::pin(work(token))),
            init: Vec::new(),
        }
    }

    /// Adds a worker that must be running before the work loop is considered
    /// healthy. Its death kills the whole group.
    pub fn with_init(mut self, worker: Box<dyn Worker>) -> Self {
        self.init.push(worker);
        self
    }
}

/// First-error-wins terminal slot.
struct Fate {
    first: Mutex<Option<Error>>,
}

impl Fate {
    fn record(&self, err: Error) {
        let mut slot = self.first.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn terminal(&self) -> Result<(), Error> {
        match &*self.first.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Handle to a fate-sharing worker group. Cheap to clone.
#[derive(Clone)]
pub struct Catacomb {
    name: Arc<str>,
    token: CancellationToken,
    fate: Arc<Fate>,
    adopt_tx: mpsc::UnboundedSender<Box<dyn Worker>>,
    dead_rx: watch::Receiver<bool>,
}

impl Catacomb {
    /// Launches the plan: the work loop starts immediately and every init
    /// worker is supervised from this point on.
    pub fn launch(plan: Plan) -> Self {
        let name: Arc<str> = Arc::from(plan.name);
        let token = CancellationToken::new();
        let fate = Arc::new(Fate {
            first: Mutex::new(None),
        });
        let (adopt_tx, adopt_rx) = mpsc::unbounded_channel::<Box<dyn Worker>>();
        let (dead_tx, dead_rx) = watch::channel(false);

        let catacomb = Self {
            name: name.clone(),
            token: token.clone(),
            fate: fate.clone(),
            adopt_tx,
            dead_rx,
        };

        let work = (plan.work)(token.child_token());
        tokio::spawn(supervise(
            name, token, fate, work, plan.init, adopt_rx, dead_tx,
        ));
        catacomb
    }

    /// Adopts a sub-worker into the group: its death kills the group, and the
    /// group's death kills it. The worker keeps its own `kill`/`wait`.
    pub fn add(&self, worker: Box<dyn Worker>) -> Result<(), Error> {
        if self.token.is_cancelled() {
            worker.kill();
            return Err(Error::Dead);
        }
        self.adopt_tx.send(worker).map_err(|send_err| {
            send_err.0.kill();
            Error::Dead
        })
    }

    /// Requests a graceful stop. Idempotent; records no error.
    pub fn kill(&self) {
        self.token.cancel();
    }

    /// Requests a stop with a reason. The first recorded reason wins.
    pub fn kill_with(&self, reason: Error) {
        self.fate.record(reason);
        self.token.cancel();
    }

    /// Token observed by cooperating tasks; cancelled once the group is
    /// dying. Child tokens derived from it are cancelled too.
    pub fn dying(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Blocks until every member has joined; returns the terminal error.
    pub async fn wait(&self) -> Result<(), Error> {
        let mut rx = self.dead_rx.clone();
        if rx.wait_for(|dead| *dead).await.is_err() {
            // Supervisor vanished without marking death: a panic in the
            // supervision loop itself. Surface whatever was recorded.
            self.fate.record(Error::Worker(format!(
                "{}: supervision loop vanished",
                self.name
            )));
        }
        self.fate.terminal()
    }

    fn state(&self) -> &'static str {
        if *self.dead_rx.borrow() {
            "dead"
        } else if self.token.is_cancelled() {
            "dying"
        } else {
            "alive"
        }
    }
}

#[async_trait::async_trait]
impl Worker for Catacomb {
    fn kill(&self) {
        Catacomb::kill(self)
    }

    async fn wait(&self) -> Result<(), Error> {
        Catacomb::wait(self).await
    }

    fn report(&self) -> Map<String, Value> {
        let mut report = Map::new();
        report.insert("name".into(), json!(&*self.name));
        report.insert("state".into(), json!(self.state()));
        report
    }
}

/// Supervision loop: one JoinSet holds the work future and one waiter per
/// adopted worker. Runs until every member has joined, then marks death.
async fn supervise(
    name: Arc<str>,
    token: CancellationToken,
    fate: Arc<Fate>,
    work: BoxFuture<'static, Result<(), Error>>,
    init: Vec<Box<dyn Worker>>,
    mut adopt_rx: mpsc::UnboundedReceiver<Box<dyn Worker>>,
    dead_tx: watch::Sender<bool>,
) {
    let mut members: JoinSet<Result<(), Error>> = JoinSet::new();
    let mut children: Vec<Arc<dyn Worker>> = Vec::new();
    let mut dying = false;
    let mut adopting = true;

    members.spawn(work);
    for worker in init {
        let child: Arc<dyn Worker> = Arc::from(worker);
        children.push(child.clone());
        members.spawn(async move { child.wait().await });
    }

    loop {
        tokio::select! {
            biased;
            adopted = adopt_rx.recv(), if adopting && !dying => match adopted {
                Some(worker) => {
                    let child: Arc<dyn Worker> = Arc::from(worker);
                    children.push(child.clone());
                    members.spawn(async move { child.wait().await });
                }
                None => adopting = false,
            },
            _ = token.cancelled(), if !dying => {
                dying = true;
                for child in &children {
                    child.kill();
                }
            }
            joined = members.join_next() => match joined {
                Some(result) => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => fate.record(err),
                        Err(join_err) => fate.record(Error::Worker(format!(
                            "{name}: member panicked: {join_err}"
                        ))),
                    }
                    if !dying {
                        dying = true;
                        token.cancel();
                        for child in &children {
                            child.kill();
                        }
                    }
                }
                None => break,
            }
        }
    }

    // Workers that raced their adoption against death: kill and join them so
    // nothing the group ever owned outlives wait().
    adopt_rx.close();
    while let Ok(worker) = adopt_rx.try_recv() {
        worker.kill();
        if let Err(err) = worker.wait().await {
            fate.record(err);
        }
    }

    debug!(catacomb = %name, "worker group dead");
    let _ = dead_tx.send(true);
}
