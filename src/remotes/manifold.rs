//! Manifold wiring for the API remote caller.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::Error;
use crate::manifold::{get_resource, Manifold, ManifoldStartFn, StartedWorker};
use crate::services::DomainServices;

use super::caller::{ApiRemotes, RemoteCallers, RemoteCallersConfig};
use super::remote::Connector;

/// Constructor hook for the caller worker, replaceable in tests.
pub type NewRemoteCallersFn =
    Arc<dyn Fn(RemoteCallersConfig) -> Result<StartedWorker, Error> + Send + Sync>;

/// Configuration of the remotes manifold.
#[derive(Clone)]
pub struct ManifoldConfig {
    /// Input name under which the domain services are published.
    pub domain_services_name: String,
    pub connector: Arc<dyn Connector>,
    /// Restart delay for per-target connection workers.
    pub restart_delay: Duration,
    pub new_worker: NewRemoteCallersFn,
}

impl ManifoldConfig {
    pub fn new(
        domain_services_name: impl Into<String>,
        connector: Arc<dyn Connector>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            domain_services_name: domain_services_name.into(),
            connector,
            restart_delay,
            new_worker: default_new_worker(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.domain_services_name.is_empty() {
            return Err(Error::NotValid("empty domain services name".into()));
        }
        if self.restart_delay.is_zero() {
            return Err(Error::NotValid("restart delay of zero".into()));
        }
        Ok(())
    }
}

/// Builds a [`RemoteCallers`] and publishes its [`ApiRemotes`] handle as the
/// manifold's output.
pub fn default_new_worker() -> NewRemoteCallersFn {
    Arc::new(|config| {
        let callers = RemoteCallers::new(config)?;
        let handle: Arc<dyn ApiRemotes> = callers.clone();
        Ok(StartedWorker::new(Box::new(callers)).with_output(handle))
    })
}

/// Manifold declaration: depends on the domain services input, starts the
/// caller worker, and exposes [`ApiRemotes`] to dependents.
pub fn manifold(config: ManifoldConfig) -> Manifold {
    let inputs = vec![config.domain_services_name.clone()];
    let start: ManifoldStartFn = Arc::new(move |getter| {
        let config = config.clone();
        Box::pin(async move {
            config.validate()?;
            let services: Arc<dyn DomainServices> =
                get_resource(getter.as_ref(), &config.domain_services_name)?;
            (config.new_worker)(RemoteCallersConfig {
                controller_node_service: services.controller_node(),
                connector: config.connector.clone(),
                restart_delay: config.restart_delay,
            })
        })
    });
    Manifold { inputs, start }
}
