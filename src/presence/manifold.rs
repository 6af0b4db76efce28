//! Manifold wiring for the presence worker.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::Error;
use crate::manifold::{get_resource, Manifold, ManifoldStartFn, StartedWorker};
use crate::remotes::ApiRemotes;
use crate::services::DomainServices;

use super::worker::{PresenceConfig, PresenceWorker};

/// Constructor hook for the presence worker, replaceable in tests.
pub type NewPresenceWorkerFn =
    Arc<dyn Fn(PresenceConfig) -> Result<StartedWorker, Error> + Send + Sync>;

/// Configuration of the presence manifold.
#[derive(Clone)]
pub struct ManifoldConfig {
    /// Input name under which the [`ApiRemotes`] handle is published.
    pub api_remote_caller_name: String,
    /// Input name under which the domain services are published.
    pub domain_services_name: String,
    /// Restart delay for trackers that died with a broken connection.
    pub restart_delay: Duration,
    pub new_worker: NewPresenceWorkerFn,
}

impl ManifoldConfig {
    pub fn new(
        api_remote_caller_name: impl Into<String>,
        domain_services_name: impl Into<String>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            api_remote_caller_name: api_remote_caller_name.into(),
            domain_services_name: domain_services_name.into(),
            restart_delay,
            new_worker: default_new_worker(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.api_remote_caller_name.is_empty() {
            return Err(Error::NotValid("empty api remote caller name".into()));
        }
        if self.domain_services_name.is_empty() {
            return Err(Error::NotValid("empty domain services name".into()));
        }
        if self.restart_delay.is_zero() {
            return Err(Error::NotValid("restart delay of zero".into()));
        }
        Ok(())
    }
}

/// Builds a [`PresenceWorker`]. The worker exposes no output; it is a leaf
/// of the dependency graph.
pub fn default_new_worker() -> NewPresenceWorkerFn {
    Arc::new(|config| {
        let worker = PresenceWorker::new(config)?;
        Ok(StartedWorker::new(Box::new(worker)))
    })
}

/// Manifold declaration: depends on the remote caller and the domain
/// services, starts the presence worker.
pub fn manifold(config: ManifoldConfig) -> Manifold {
    let inputs = vec![
        config.api_remote_caller_name.clone(),
        config.domain_services_name.clone(),
    ];
    let start: ManifoldStartFn = Arc::new(move |getter| {
        let config = config.clone();
        Box::pin(async move {
            config.validate()?;
            let remotes: Arc<dyn ApiRemotes> =
                get_resource(getter.as_ref(), &config.api_remote_caller_name)?;
            let services: Arc<dyn DomainServices> =
                get_resource(getter.as_ref(), &config.domain_services_name)?;
            (config.new_worker)(PresenceConfig::new(
                remotes,
                services.status(),
                config.restart_delay,
            ))
        })
    });
    Manifold { inputs, start }
}
