//! Pool actor and its public handle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catacomb::{Catacomb, Plan, Worker};
use crate::errors::Error;
use crate::policy::RestartParams;

/// Constructor for a tracked worker. Retained by the runner so a restart can
/// re-invoke it under the same name. The token is cancelled if the runner
/// starts dying while construction is still in flight.
pub type StartFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Box<dyn Worker>, Error>> + Send + Sync>;

enum Msg {
    Start {
        name: String,
        start: StartFn,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Stop {
        name: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Claim {
        name: String,
        reply: oneshot::Sender<Result<Arc<dyn Worker>, Error>>,
    },
    Started {
        name: String,
        result: Result<Box<dyn Worker>, Error>,
    },
    Done {
        name: String,
        result: Result<(), Error>,
    },
    RestartDue {
        name: String,
    },
}

enum Phase {
    /// Start function invoked, result not yet observed.
    Starting,
    /// Live worker.
    Running(Arc<dyn Worker>),
    /// Dead, waiting out the restart delay.
    Waiting,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Running(_) => "running",
            Phase::Waiting => "restarting",
        }
    }
}

struct Tracked {
    phase: Phase,
    start: StartFn,
    restarts: u32,
    stopping: bool,
    stop_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    claim_waiters: Vec<oneshot::Sender<Result<Arc<dyn Worker>, Error>>>,
}

/// Read-side snapshot of one tracked worker, mirrored by the actor.
struct Snapshot {
    state: &'static str,
    restarts: u32,
    worker: Option<Arc<dyn Worker>>,
}

type Registry = Arc<RwLock<HashMap<String, Snapshot>>>;

/// Named worker pool with pluggable restart policy. See the module docs.
pub struct Runner {
    catacomb: Catacomb,
    tx: mpsc::UnboundedSender<Msg>,
    registry: Registry,
}

impl Runner {
    /// Creates the pool and starts its actor immediately.
    pub fn new(name: impl Into<String>, params: RestartParams) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

        let actor_tx = tx.clone();
        let actor_registry = registry.clone();
        let catacomb = Catacomb::launch(Plan::new(name, move |dying| {
            PoolActor {
                map: HashMap::new(),
                params,
                registry: actor_registry,
                tx: actor_tx,
                dying,
                shutting_down: false,
                fatal: None,
            }
            .run(rx)
        }));

        Arc::new(Self {
            catacomb,
            tx,
            registry,
        })
    }

    /// Registers and starts a worker under `name`.
    ///
    /// The start function is invoked asynchronously; this call returns once
    /// the name is registered. [`Error::AlreadyExists`] if the name is live.
    pub async fn start_worker(&self, name: &str, start: StartFn) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Start {
            name: name.to_string(),
            start,
            reply,
        })?;
        rx.await.map_err(|_| Error::Dead)?
    }

    /// Kills the named worker and blocks until it has been removed from the
    /// pool, or until `abort` fires ([`Error::Aborted`]). The removal itself
    /// keeps going even when the caller gives up waiting.
    pub async fn stop_and_remove_worker(
        &self,
        name: &str,
        abort: &CancellationToken,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Stop {
            name: name.to_string(),
            reply,
        })?;
        tokio::select! {
            res = rx => res.map_err(|_| Error::Dead)?,
            _ = abort.cancelled() => Err(Error::Aborted(format!("stopping \"{name}\""))),
        }
    }

    /// Returns the live handle for `name`, waiting through an in-flight start
    /// or restart delay. [`Error::NotFound`] for unknown names,
    /// [`Error::Dead`] once the runner has died, [`Error::Aborted`] if
    /// `abort` fires first.
    pub async fn worker(
        &self,
        name: &str,
        abort: &CancellationToken,
    ) -> Result<Arc<dyn Worker>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Claim {
            name: name.to_string(),
            reply,
        })?;
        tokio::select! {
            res = rx => res.map_err(|_| Error::Dead)?,
            _ = abort.cancelled() => Err(Error::Aborted(format!("claiming \"{name}\""))),
        }
    }

    /// Sorted snapshot of currently tracked names, including workers waiting
    /// out a restart delay.
    pub fn worker_names(&self) -> Vec<String> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn send(&self, msg: Msg) -> Result<(), Error> {
        self.tx.send(msg).map_err(|_| Error::Dead)
    }
}

#[async_trait::async_trait]
impl Worker for Runner {
    fn kill(&self) {
        self.catacomb.kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        self.catacomb.wait().await
    }

    /// Aggregates per-worker reports keyed by name. Reads the mirror
    /// snapshot, so a wedged child cannot block it.
    fn report(&self) -> Map<String, Value> {
        let mut report = self.catacomb.report();
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let mut workers = Map::new();
        for (name, snap) in registry.iter() {
            let mut entry = Map::new();
            entry.insert("state".into(), json!(snap.state));
            entry.insert("restarts".into(), json!(snap.restarts));
            if let Some(worker) = &snap.worker {
                entry.insert("report".into(), Value::Object(worker.report()));
            }
            workers.insert(name.clone(), Value::Object(entry));
        }
        report.insert("workers".into(), Value::Object(workers));
        report
    }
}

struct PoolActor {
    map: HashMap<String, Tracked>,
    params: RestartParams,
    registry: Registry,
    tx: mpsc::UnboundedSender<Msg>,
    dying: CancellationToken,
    shutting_down: bool,
    fatal: Option<Error>,
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) -> Result<(), Error> {
        loop {
            if self.shutting_down && self.map.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.dying.cancelled(), if !self.shutting_down => self.begin_shutdown(),
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Start { name, start, reply } => {
                let _ = reply.send(self.handle_start(name, start));
            }
            Msg::Stop { name, reply } => self.handle_stop(&name, reply),
            Msg::Claim { name, reply } => self.handle_claim(&name, reply),
            Msg::Started { name, result } => self.handle_started(name, result),
            Msg::Done { name, result } => self.handle_done(name, result),
            Msg::RestartDue { name } => self.handle_restart_due(name),
        }
    }

    fn handle_start(&mut self, name: String, start: StartFn) -> Result<(), Error> {
        if self.shutting_down {
            return Err(Error::Dead);
        }
        if self.map.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        self.map.insert(
            name.clone(),
            Tracked {
                phase: Phase::Starting,
                start: start.clone(),
                restarts: 0,
                stopping: false,
                stop_waiters: Vec::new(),
                claim_waiters: Vec::new(),
            },
        );
        self.mirror(&name);
        self.spawn_starter(name, start);
        Ok(())
    }

    fn handle_stop(&mut self, name: &str, reply: oneshot::Sender<Result<(), Error>>) {
        let Some(entry) = self.map.get_mut(name) else {
            let _ = reply.send(Err(Error::NotFound(name.to_string())));
            return;
        };
        entry.stop_waiters.push(reply);
        if entry.stopping {
            return;
        }
        entry.stopping = true;
        match &entry.phase {
            Phase::Running(worker) => worker.kill(),
            Phase::Starting => {} // killed as soon as the start resolves
            Phase::Waiting => {
                // No live worker to kill; cancel the pending restart instead.
                self.remove(name);
            }
        }
    }

    fn handle_claim(&mut self, name: &str, reply: oneshot::Sender<Result<Arc<dyn Worker>, Error>>) {
        if self.shutting_down {
            let _ = reply.send(Err(Error::Dead));
            return;
        }
        let Some(entry) = self.map.get_mut(name) else {
            let _ = reply.send(Err(Error::NotFound(name.to_string())));
            return;
        };
        match &entry.phase {
            Phase::Running(worker) if !entry.stopping => {
                let _ = reply.send(Ok(worker.clone()));
            }
            _ => entry.claim_waiters.push(reply),
        }
    }

    fn handle_started(&mut self, name: String, result: Result<Box<dyn Worker>, Error>) {
        if !self.map.contains_key(&name) {
            if let Ok(worker) = result {
                // Raced a removal; nothing tracks it, so reap it here.
                worker.kill();
                tokio::spawn(async move {
                    let _ = worker.wait().await;
                });
            }
            return;
        }
        match result {
            Ok(worker) => {
                let worker: Arc<dyn Worker> = Arc::from(worker);
                let entry = self.map.get_mut(&name).expect("checked above");
                entry.phase = Phase::Running(worker.clone());
                let doomed = self.shutting_down || entry.stopping;
                if doomed {
                    worker.kill();
                } else {
                    for waiter in entry.claim_waiters.drain(..) {
                        let _ = waiter.send(Ok(worker.clone()));
                    }
                }
                self.mirror(&name);
                self.spawn_monitor(name, worker);
            }
            Err(err) => {
                let entry = self.map.get_mut(&name).expect("checked above");
                if self.shutting_down || entry.stopping {
                    self.remove(&name);
                } else {
                    self.decide(&name, err);
                }
            }
        }
    }

    fn handle_done(&mut self, name: String, result: Result<(), Error>) {
        let Some(entry) = self.map.get_mut(&name) else {
            return;
        };
        if self.shutting_down || entry.stopping {
            if let Err(err) = &result {
                debug!(worker = %name, error = %err, "worker stopped with error during removal");
            }
            self.remove(&name);
            return;
        }
        match result {
            Ok(()) => {
                debug!(worker = %name, "worker finished cleanly; removing");
                self.remove(&name);
            }
            Err(err) => self.decide(&name, err),
        }
    }

    fn handle_restart_due(&mut self, name: String) {
        let Some(entry) = self.map.get_mut(&name) else {
            return;
        };
        if !matches!(entry.phase, Phase::Waiting) || entry.stopping || self.shutting_down {
            return;
        }
        entry.phase = Phase::Starting;
        let start = entry.start.clone();
        self.mirror(&name);
        self.spawn_starter(name, start);
    }

    /// Restart policy decision for a worker that died with an error.
    fn decide(&mut self, name: &str, err: Error) {
        if (self.params.is_fatal)(&err) {
            warn!(worker = %name, error = %err, "worker failed fatally; removed permanently");
            self.remove(name);
            if (self.params.kills_runner)(&err) {
                self.fatal = Some(err);
                self.begin_shutdown();
            }
        } else if (self.params.should_restart)(&err) {
            let entry = self.map.get_mut(name).expect("caller checked presence");
            let delay = self.params.backoff.next(entry.restarts);
            entry.restarts += 1;
            entry.phase = Phase::Waiting;
            info!(worker = %name, error = %err, ?delay, "worker failed; restart scheduled");
            self.mirror(name);
            self.spawn_restart_timer(name.to_string(), delay);
        } else {
            info!(worker = %name, error = %err, "worker failed; removed without restart");
            self.remove(name);
        }
    }

    fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        let waiting: Vec<String> = self
            .map
            .iter()
            .filter(|(_, e)| matches!(e.phase, Phase::Waiting))
            .map(|(n, _)| n.clone())
            .collect();
        for name in waiting {
            self.remove(&name);
        }
        for entry in self.map.values_mut() {
            entry.stopping = true;
            if let Phase::Running(worker) = &entry.phase {
                worker.kill();
            }
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(entry) = self.map.remove(name) {
            for waiter in entry.stop_waiters {
                let _ = waiter.send(Ok(()));
            }
            let claim_err = if self.shutting_down {
                Error::Dead
            } else {
                Error::NotFound(name.to_string())
            };
            for waiter in entry.claim_waiters {
                let _ = waiter.send(Err(claim_err.clone()));
            }
        }
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Mirrors one entry into the read-side snapshot.
    fn mirror(&self, name: &str) {
        let Some(entry) = self.map.get(name) else {
            return;
        };
        let worker = match &entry.phase {
            Phase::Running(worker) => Some(worker.clone()),
            _ => None,
        };
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.to_string(),
                Snapshot {
                    state: entry.phase.label(),
                    restarts: entry.restarts,
                    worker,
                },
            );
    }

    fn spawn_starter(&self, name: String, start: StartFn) {
        let tx = self.tx.clone();
        let token = self.dying.child_token();
        tokio::spawn(async move {
            let result = start(token).await;
            let _ = tx.send(Msg::Started { name, result });
        });
    }

    fn spawn_monitor(&self, name: String, worker: Arc<dyn Worker>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = worker.wait().await;
            let _ = tx.send(Msg::Done { name, result });
        });
    }

    fn spawn_restart_timer(&self, name: String, delay: std::time::Duration) {
        let tx = self.tx.clone();
        let dying = self.dying.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    let _ = tx.send(Msg::RestartDue { name });
                }
                _ = dying.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Worker that idles until killed.
    fn idle() -> Box<dyn Worker> {
        Box::new(Catacomb::launch(Plan::new(
            "idle",
            |dying: CancellationToken| async move {
                dying.cancelled().await;
                Ok(())
            },
        )))
    }

    /// Worker that fails immediately with the given error.
    fn doomed(err: Error) -> Box<dyn Worker> {
        Box::new(Catacomb::launch(Plan::new("doomed", |_dying| async move {
            Err(err)
        })))
    }

    fn idle_start(counter: Arc<AtomicUsize>) -> StartFn {
        Arc::new(move |_token| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(idle()) })
        })
    }

    /// Start function that fails with `err` the first `failures` times, then
    /// produces idle workers.
    fn flaky_start(counter: Arc<AtomicUsize>, failures: usize, err: Error) -> StartFn {
        Arc::new(move |_token| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let err = err.clone();
            Box::pin(async move {
                if attempt < failures {
                    Ok(doomed(err))
                } else {
                    Ok(idle())
                }
            })
        })
    }

    /// Polls until `pred` holds; paused-clock friendly.
    async fn eventually(mut pred: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if pred() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn start_claim_and_list() {
        let runner = Runner::new("pool", RestartParams::default());
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("controller-0", idle_start(starts.clone()))
            .await
            .unwrap();

        let abort = CancellationToken::new();
        let handle = runner.worker("controller-0", &abort).await.unwrap();
        assert_eq!(handle.report()["name"], json!("idle"));
        assert_eq!(runner.worker_names(), vec!["controller-0".to_string()]);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_name_is_rejected_while_live() {
        let runner = Runner::new("pool", RestartParams::default());
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("w", idle_start(starts.clone()))
            .await
            .unwrap();
        let err = runner
            .start_worker("w", idle_start(starts.clone()))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test(start_paused = true)]
    async fn restartable_error_respawns_under_same_name() {
        let delay = Duration::from_secs(3);
        let runner = Runner::new(
            "pool",
            RestartParams::with_delay(delay).restart_if(|e| e.is_broken_connection()),
        );
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker(
                "controller-0",
                flaky_start(starts.clone(), 1, Error::BrokenConnection),
            )
            .await
            .unwrap();

        // The name stays tracked through the failure and the delay.
        let starts_probe = starts.clone();
        eventually(move || starts_probe.load(Ordering::SeqCst) == 2).await;
        assert_eq!(runner.worker_names(), vec!["controller-0".to_string()]);

        let abort = CancellationToken::new();
        let handle = runner.worker("controller-0", &abort).await.unwrap();
        assert_eq!(handle.report()["state"], json!("alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_waits_out_the_configured_delay() {
        let delay = Duration::from_secs(10);
        let runner = Runner::new("pool", RestartParams::with_delay(delay));
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("w", flaky_start(starts.clone(), 1, Error::BrokenConnection))
            .await
            .unwrap();

        let before = time::Instant::now();
        let starts_probe = starts.clone();
        eventually(move || starts_probe.load(Ordering::SeqCst) == 2).await;
        assert!(before.elapsed() >= delay);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_removes_permanently() {
        let runner = Runner::new(
            "pool",
            RestartParams::with_delay(Duration::from_millis(10)).fatal_if(|e| e.is_not_valid()),
        );
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("w", flaky_start(starts.clone(), 9, Error::NotValid("w".into())))
            .await
            .unwrap();

        let runner_probe = runner.clone();
        eventually(move || runner_probe.worker_names().is_empty()).await;
        // Plenty of paused-clock time for a wrongful restart to have fired.
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        // The runner itself survives a fatal child by default.
        assert_eq!(runner.report()["state"], json!("alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn runner_fatal_child_kills_the_runner() {
        let runner = Runner::new(
            "pool",
            RestartParams::default()
                .fatal_if(|e| e.is_not_valid())
                .runner_fatal_if(|e| e.is_not_valid()),
        );
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("w", flaky_start(starts.clone(), 9, Error::NotValid("w".into())))
            .await
            .unwrap();
        assert_eq!(runner.wait().await, Err(Error::NotValid("w".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_remove_blocks_until_removed() {
        let runner = Runner::new("pool", RestartParams::default());
        let starts = Arc::new(AtomicUsize::new(0));
        runner.start_worker("w", idle_start(starts)).await.unwrap();

        let abort = CancellationToken::new();
        runner.stop_and_remove_worker("w", &abort).await.unwrap();
        assert!(runner.worker_names().is_empty());

        let err = runner.stop_and_remove_worker("w", &abort).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_remove_aborts_on_wedged_worker() {
        let runner = Runner::new("pool", RestartParams::default());
        // Ignores its dying token entirely.
        let start: StartFn = Arc::new(|_token| {
            Box::pin(async {
                Ok(Box::new(Catacomb::launch(Plan::new("wedged", |_dying| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }))) as Box<dyn Worker>)
            })
        });
        runner.start_worker("w", start).await.unwrap();
        let abort = CancellationToken::new();
        let guard = abort.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(5)).await;
            guard.cancel();
        });
        let err = runner.stop_and_remove_worker("w", &abort).await.unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_during_restart_delay_cancels_the_restart() {
        let runner = Runner::new("pool", RestartParams::with_delay(Duration::from_secs(60)));
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("w", flaky_start(starts.clone(), 9, Error::BrokenConnection))
            .await
            .unwrap();

        let runner_probe = runner.clone();
        eventually(move || {
            runner_probe.report()["workers"]["w"]["state"] == json!("restarting")
        })
        .await;
        let abort = CancellationToken::new();
        runner.stop_and_remove_worker("w", &abort).await.unwrap();

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(runner.worker_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn killing_the_runner_stops_all_workers() {
        let runner = Runner::new("pool", RestartParams::default());
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("a", idle_start(starts.clone()))
            .await
            .unwrap();
        runner
            .start_worker("b", idle_start(starts.clone()))
            .await
            .unwrap();
        let abort = CancellationToken::new();
        let a = runner.worker("a", &abort).await.unwrap();

        runner.kill();
        runner.wait().await.unwrap();
        assert!(runner.worker_names().is_empty());
        assert_eq!(a.wait().await, Ok(()));

        let err = runner
            .start_worker("c", idle_start(starts.clone()))
            .await
            .unwrap_err();
        assert!(err.is_dead());
    }

    #[tokio::test(start_paused = true)]
    async fn report_aggregates_worker_state() {
        let runner = Runner::new("pool", RestartParams::default());
        let starts = Arc::new(AtomicUsize::new(0));
        runner
            .start_worker("controller-0", idle_start(starts))
            .await
            .unwrap();
        let abort = CancellationToken::new();
        runner.worker("controller-0", &abort).await.unwrap();

        let report = runner.report();
        let entry = &report["workers"]["controller-0"];
        assert_eq!(entry["state"], json!("running"));
        assert_eq!(entry["restarts"], json!(0));
        assert_eq!(entry["report"]["state"], json!("alive"));
    }
}
