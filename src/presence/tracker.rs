//! Per-connection liveness tracker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catacomb::{Catacomb, Plan, Worker};
use crate::errors::Error;
use crate::remotes::RemoteConnection;
use crate::runner::StartFn;
use crate::services::StatusService;

/// Tracks one remote controller's connection and removes its presence
/// records once the connection is confirmed broken.
///
/// One incarnation covers one connection lifetime: wait for a live
/// connection, watch it, and on the broken signal run the cleanup exactly
/// once before terminating with [`Error::BrokenConnection`] so the owning
/// runner restarts the tracker for the next connection. Cleanup also runs
/// when the connection is already broken at the first liveness check.
pub struct ConnectionTracker {
    catacomb: Catacomb,
    remote: RemoteConnection,
    connected: Arc<AtomicBool>,
}

impl ConnectionTracker {
    pub fn new(remote: RemoteConnection, status: Arc<dyn StatusService>) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let state = remote.clone();
        let seen = connected.clone();
        let catacomb = Catacomb::launch(Plan::new(
            format!("presence-{}", remote.controller_id()),
            move |dying| track(state, status, seen, dying),
        ));
        Self {
            catacomb,
            remote,
            connected,
        }
    }

    /// Start function for a runner, reusable across restarts.
    pub fn start_fn(remote: RemoteConnection, status: Arc<dyn StatusService>) -> StartFn {
        Arc::new(move |_token| {
            let remote = remote.clone();
            let status = status.clone();
            Box::pin(async move {
                Ok(Box::new(ConnectionTracker::new(remote, status)) as Box<dyn Worker>)
            })
        })
    }
}

#[async_trait]
impl Worker for ConnectionTracker {
    fn kill(&self) {
        self.catacomb.kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        self.catacomb.wait().await
    }

    fn report(&self) -> Map<String, Value> {
        let mut report = Map::new();
        report.insert("controller-id".into(), json!(self.remote.controller_id()));
        report.insert(
            "connected".into(),
            json!(self.connected.load(Ordering::SeqCst)),
        );
        report
    }
}

async fn track(
    remote: RemoteConnection,
    status: Arc<dyn StatusService>,
    connected: Arc<AtomicBool>,
    dying: CancellationToken,
) -> Result<(), Error> {
    let conn = match remote.connection(&dying).await {
        Ok(conn) => conn,
        Err(Error::Aborted(_)) if dying.is_cancelled() => return Ok(()),
        Err(err) => return Err(err),
    };

    if !conn.is_broken() {
        connected.store(true, Ordering::SeqCst);
        let broken = conn.broken();
        let stopped = tokio::select! {
            _ = broken.cancelled() => false,
            _ = dying.cancelled() => true,
        };
        connected.store(false, Ordering::SeqCst);
        if stopped {
            return Ok(());
        }
    }

    // Single cleanup path: reached once per incarnation, whether the
    // connection broke while watched or was already broken on arrival.
    let machine = remote.controller_id().to_string();
    let unit = format!("controller/{machine}");
    info!(controller = %machine, "connection broken; removing presence records");
    if let Err(err) = status.delete_machine_presence(&machine).await {
        warn!(machine = %machine, error = %err, "failed to delete machine presence");
    }
    if let Err(err) = status.delete_unit_presence(&unit).await {
        warn!(unit = %unit, error = %err, "failed to delete unit presence");
    }
    Err(Error::BrokenConnection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remotes::testing::{ArcConnection, FakeConnection};
    use crate::remotes::Connection;
    use crate::services::testing::FakeStatusService;
    use std::time::Duration;
    use tokio::time;

    async fn eventually(mut pred: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if pred() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn inject_healthy(remote: &RemoteConnection) -> CancellationToken {
        let (conn, breaker) = FakeConnection::healthy();
        let conn: Arc<dyn Connection> = Arc::new(ArcConnection(conn));
        remote.inject_connection(Some(conn));
        breaker
    }

    fn inject_broken(remote: &RemoteConnection) {
        let conn: Arc<dyn Connection> = FakeConnection::broken_from_birth();
        remote.inject_connection(Some(conn));
    }

    #[tokio::test(start_paused = true)]
    async fn broken_connection_triggers_cleanup_exactly_once() {
        let remote = RemoteConnection::new("0", vec!["10.0.0.1:17070".into()]);
        let status = FakeStatusService::new();
        let breaker = inject_healthy(&remote);
        let tracker = ConnectionTracker::new(remote.clone(), status.clone());

        let probe = tracker.connected.clone();
        eventually(move || probe.load(Ordering::SeqCst)).await;
        assert_eq!(tracker.report()["connected"], json!(true));

        // Fire the broken signal more than once; one cleanup must result.
        breaker.cancel();
        breaker.cancel();
        assert_eq!(tracker.wait().await, Err(Error::BrokenConnection));
        assert_eq!(*status.machines.lock().unwrap(), vec!["0".to_string()]);
        assert_eq!(
            *status.units.lock().unwrap(),
            vec!["controller/0".to_string()]
        );
        assert_eq!(tracker.report()["connected"], json!(false));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_broken_at_first_check_still_cleans_up() {
        let remote = RemoteConnection::new("3", vec!["10.0.0.1:17070".into()]);
        let status = FakeStatusService::new();
        inject_broken(&remote);
        let tracker = ConnectionTracker::new(remote.clone(), status.clone());

        assert_eq!(tracker.wait().await, Err(Error::BrokenConnection));
        // Never observed as connected, cleaned up anyway.
        assert_eq!(tracker.report()["connected"], json!(false));
        assert_eq!(*status.machines.lock().unwrap(), vec!["3".to_string()]);
        assert_eq!(
            *status.units.lock().unwrap(),
            vec!["controller/3".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kill_while_waiting_for_a_connection_is_clean() {
        let remote = RemoteConnection::new("0", vec!["10.0.0.1:17070".into()]);
        let status = FakeStatusService::new();
        let tracker = ConnectionTracker::new(remote, status.clone());

        time::sleep(Duration::from_secs(1)).await;
        tracker.kill();
        assert_eq!(tracker.wait().await, Ok(()));
        assert!(status.machines.lock().unwrap().is_empty());
        assert!(status.units.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn kill_while_connected_does_not_clean_up() {
        let remote = RemoteConnection::new("0", vec!["10.0.0.1:17070".into()]);
        let status = FakeStatusService::new();
        let _breaker = inject_healthy(&remote);
        let tracker = ConnectionTracker::new(remote, status.clone());

        let probe = tracker.connected.clone();
        eventually(move || probe.load(Ordering::SeqCst)).await;
        tracker.kill();
        assert_eq!(tracker.wait().await, Ok(()));
        assert!(status.machines.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_failures_are_tolerated() {
        let remote = RemoteConnection::new("0", vec!["10.0.0.1:17070".into()]);
        let status = FakeStatusService::new();
        status.fail.store(true, Ordering::SeqCst);
        inject_broken(&remote);
        let tracker = ConnectionTracker::new(remote, status.clone());

        // The delete errors are logged, not propagated; the tracker still
        // terminates with the restartable sentinel.
        assert_eq!(tracker.wait().await, Err(Error::BrokenConnection));
        assert!(status.machines.lock().unwrap().is_empty());
    }
}
