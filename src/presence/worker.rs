//! The presence worker: one tracker per remote controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::tracker::ConnectionTracker;
use crate::catacomb::{Catacomb, Plan, Worker};
use crate::errors::Error;
use crate::policy::RestartParams;
use crate::remotes::{ApiRemotes, RemoteConnection};
use crate::runner::Runner;
use crate::services::StatusService;

/// Presence worker configuration.
#[derive(Clone)]
pub struct PresenceConfig {
    pub remotes: Arc<dyn ApiRemotes>,
    pub status_service: Arc<dyn StatusService>,
    /// Restart delay for trackers that died with a broken connection.
    pub restart_delay: Duration,
    /// How long a removal waits for a tracker to stop before giving up.
    pub stop_budget: Duration,
}

impl PresenceConfig {
    pub fn new(
        remotes: Arc<dyn ApiRemotes>,
        status_service: Arc<dyn StatusService>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            remotes,
            status_service,
            restart_delay,
            stop_budget: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.restart_delay.is_zero() {
            return Err(Error::NotValid("restart delay of zero".into()));
        }
        if self.stop_budget.is_zero() {
            return Err(Error::NotValid("stop budget of zero".into()));
        }
        Ok(())
    }
}

/// Keeps one [`ConnectionTracker`] per remote controller.
///
/// Subscribes to the remote set and, on every notification, diffs the
/// current remotes against its runner: vanished targets have their tracker
/// stopped (bounded by the stop budget), new targets get one. Trackers that
/// die with [`Error::BrokenConnection`] are restarted after the delay; any
/// other tracker failure removes it until the next change notification.
pub struct PresenceWorker {
    catacomb: Catacomb,
    runner: Arc<Runner>,
}

impl PresenceWorker {
    pub fn new(config: PresenceConfig) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let runner = Runner::new(
            "presence-trackers",
            RestartParams::with_delay(config.restart_delay)
                .restart_if(|err| err.is_broken_connection()),
        );

        let loop_runner = runner.clone();
        let catacomb = Catacomb::launch(
            Plan::new("controller-presence", move |dying| {
                run(config, loop_runner, dying)
            })
            .with_init(Box::new(runner.clone())),
        );

        Ok(Arc::new(Self { catacomb, runner }))
    }

    /// Sorted names of currently tracked targets.
    pub fn tracker_names(&self) -> Vec<String> {
        self.runner.worker_names()
    }
}

#[async_trait]
impl Worker for PresenceWorker {
    fn kill(&self) {
        self.catacomb.kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        self.catacomb.wait().await
    }

    fn report(&self) -> Map<String, Value> {
        let mut report = self.catacomb.report();
        report.insert("trackers".into(), Value::Object(self.runner.report()));
        report
    }
}

async fn run(
    config: PresenceConfig,
    runner: Arc<Runner>,
    dying: CancellationToken,
) -> Result<(), Error> {
    let mut sub = config.remotes.subscribe().await?;
    loop {
        tokio::select! {
            _ = dying.cancelled() => return Ok(()),
            changed = sub.changes() => match changed {
                Some(()) => reconcile(&config, &runner, &dying).await?,
                None => {
                    return Err(Error::Worker(
                        "api remotes subscription closed unexpectedly".into(),
                    ));
                }
            },
        }
    }
}

/// Aligns the tracker set with the current remotes. Removals run before
/// additions; a stuck tracker only costs its stop budget, not the worker.
async fn reconcile(
    config: &PresenceConfig,
    runner: &Runner,
    dying: &CancellationToken,
) -> Result<(), Error> {
    let remotes = config.remotes.get_api_remotes().await?;
    let desired: HashMap<String, RemoteConnection> = remotes
        .into_iter()
        .map(|remote| (crate::remotes::target_name(remote.controller_id()), remote))
        .collect();

    for name in runner.worker_names() {
        if desired.contains_key(&name) {
            continue;
        }
        let abort = deadline_token(dying, config.stop_budget);
        match runner.stop_and_remove_worker(&name, &abort).await {
            Ok(()) | Err(Error::NotFound(_)) => {
                info!(tracker = %name, "removed presence tracker");
            }
            Err(Error::Aborted(_)) => {
                warn!(tracker = %name, "tracker did not stop within budget; moving on");
            }
            Err(err) => return Err(err),
        }
    }

    for (name, remote) in desired {
        let start = ConnectionTracker::start_fn(remote, config.status_service.clone());
        match runner.start_worker(&name, start).await {
            Ok(()) => info!(tracker = %name, "started presence tracker"),
            Err(Error::AlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Child of `parent` that additionally fires after `budget` elapses.
fn deadline_token(parent: &CancellationToken, budget: Duration) -> CancellationToken {
    let token = parent.child_token();
    let deadline = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = time::sleep(budget) => deadline.cancel(),
            _ = deadline.cancelled() => {}
        }
    });
    token
}
