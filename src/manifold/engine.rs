//! Dependency engine: a runner over manifold starts.
//!
//! Each installed manifold runs as a worker in an internal [`Runner`] whose
//! restart policy retries [`Error::DependencyMissing`] (and ordinary worker
//! failures) after a delay, and treats validation failures as permanently
//! fatal. Outputs of started workers are published into a shared map that
//! dependents resolve through their [`Getter`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use super::wiring::{Getter, Manifold, Output};
use crate::catacomb::Worker;
use crate::errors::Error;
use crate::policy::RestartParams;
use crate::runner::{Runner, StartFn};

type Outputs = Arc<RwLock<HashMap<String, Output>>>;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineParams {
    /// Delay between start attempts of a manifold whose inputs are missing
    /// (and between restarts of a failed manifold worker).
    pub retry_delay: Duration,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Process-wide registry of named manifolds.
///
/// Installation starts the manifold's worker immediately; starts that fail
/// because an input is not ready yet are retried until the input's provider
/// has been installed and produced its output.
pub struct Engine {
    runner: Arc<Runner>,
    outputs: Outputs,
}

impl Engine {
    pub fn new(params: EngineParams) -> Arc<Self> {
        let restart = RestartParams::with_delay(params.retry_delay)
            .fatal_if(|err| err.is_not_valid())
            .restart_if(|_| true);
        Arc::new(Self {
            runner: Runner::new("dependency-engine", restart),
            outputs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Installs a manifold under `name` and starts it. The name is the only
    /// contract dependents rely on.
    pub async fn install(&self, name: &str, manifold: Manifold) -> Result<(), Error> {
        let getter: Arc<dyn Getter> = Arc::new(EngineGetter {
            declared: manifold.inputs.clone(),
            outputs: self.outputs.clone(),
        });
        let outputs = self.outputs.clone();
        let manifold_name = name.to_string();

        let start: StartFn = Arc::new(move |_token| {
            let manifold = manifold.clone();
            let getter = getter.clone();
            let outputs = outputs.clone();
            let manifold_name = manifold_name.clone();
            Box::pin(async move {
                // A fresh attempt invalidates whatever this worker published
                // before it last died.
                outputs
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&manifold_name);
                let started = (manifold.start)(getter).await?;
                if let Some(output) = started.output {
                    outputs
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(manifold_name.clone(), output);
                }
                debug!(manifold = %manifold_name, "manifold worker started");
                Ok(started.worker)
            })
        });
        self.runner.start_worker(name, start).await
    }

    /// Names of currently installed manifolds.
    pub fn manifold_names(&self) -> Vec<String> {
        self.runner.worker_names()
    }
}

#[async_trait::async_trait]
impl Worker for Engine {
    fn kill(&self) {
        self.runner.kill()
    }

    async fn wait(&self) -> Result<(), Error> {
        self.runner.wait().await
    }

    fn report(&self) -> Map<String, Value> {
        self.runner.report()
    }
}

/// Getter scoped to one manifold's declared inputs.
struct EngineGetter {
    declared: Vec<String>,
    outputs: Outputs,
}

impl Getter for EngineGetter {
    fn get_output(&self, name: &str) -> Result<Output, Error> {
        if !self.declared.iter().any(|input| input == name) {
            return Err(Error::NotValid(format!(
                "\"{name}\" not declared as an input"
            )));
        }
        self.outputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DependencyMissing(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catacomb::{Catacomb, Plan};
    use crate::manifold::{get_resource, ManifoldStartFn, StartedWorker};
    use tokio::time;
    use tokio_util::sync::CancellationToken;

    fn idle_worker() -> Box<dyn Worker> {
        Box::new(Catacomb::launch(Plan::new(
            "idle",
            |dying: CancellationToken| async move {
                dying.cancelled().await;
                Ok(())
            },
        )))
    }

    /// Manifold with no inputs that publishes a string output.
    fn provider(value: &str) -> Manifold {
        let value = value.to_string();
        let start: ManifoldStartFn = Arc::new(move |_getter| {
            let value = value.clone();
            Box::pin(async move {
                Ok(StartedWorker::new(idle_worker()).with_output(value))
            })
        });
        Manifold {
            inputs: Vec::new(),
            start,
        }
    }

    /// Manifold that resolves `input` and records what it saw.
    fn consumer(input: &str, seen: Arc<std::sync::Mutex<Option<String>>>) -> Manifold {
        let inputs = vec![input.to_string()];
        let input = input.to_string();
        let start: ManifoldStartFn = Arc::new(move |getter| {
            let input = input.clone();
            let seen = seen.clone();
            Box::pin(async move {
                let value: String = get_resource(getter.as_ref(), &input)?;
                *seen.lock().unwrap() = Some(value);
                Ok(StartedWorker::new(idle_worker()))
            })
        });
        Manifold { inputs, start }
    }

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
    async fn consumer_waits_for_its_provider() {
        let engine = Engine::new(EngineParams::default());
        let seen = Arc::new(std::sync::Mutex::new(None));

        // Install the consumer first: its starts keep failing with a missing
        // dependency until the provider lands.
        engine
            .install("consumer", consumer("provider", seen.clone()))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), None);

        engine.install("provider", provider("payload")).await.unwrap();
        let seen_probe = seen.clone();
        eventually(move || seen_probe.lock().unwrap().is_some()).await;
        assert_eq!(seen.lock().unwrap().as_deref(), Some("payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn undeclared_input_is_rejected_not_retried_forever() {
        let engine = Engine::new(EngineParams::default());
        engine.install("provider", provider("payload")).await.unwrap();

        // Asks for an input it never declared: NotValid, which the engine's
        // policy treats as permanently fatal.
        let start: ManifoldStartFn = Arc::new(|getter| {
            Box::pin(async move {
                let _: String = get_resource(getter.as_ref(), "provider")?;
                Ok(StartedWorker::new(idle_worker()))
            })
        });
        engine
            .install(
                "rogue",
                Manifold {
                    inputs: Vec::new(),
                    start,
                },
            )
            .await
            .unwrap();

        let engine_probe = engine.clone();
        eventually(move || !engine_probe.manifold_names().contains(&"rogue".to_string())).await;
        assert!(engine.manifold_names().contains(&"provider".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_install_is_already_exists() {
        let engine = Engine::new(EngineParams::default());
        engine.install("provider", provider("a")).await.unwrap();
        let err = engine.install("provider", provider("b")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test(start_paused = true)]
    async fn killing_the_engine_stops_every_manifold_worker() {
        let engine = Engine::new(EngineParams::default());
        engine.install("provider", provider("payload")).await.unwrap();
        engine.kill();
        engine.wait().await.unwrap();
        assert!(engine.manifold_names().is_empty());
    }
}
