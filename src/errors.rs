//! Error types shared across the runtime.
//!
//! A single [`Error`] enum covers the whole taxonomy the runtime needs:
//!
//! - **Validation** ([`Error::NotValid`]) — a config is missing a required
//!   field; always fatal, always returned before any task is spawned.
//! - **Registry conditions** ([`Error::AlreadyExists`], [`Error::NotFound`],
//!   [`Error::Dead`], [`Error::Aborted`]) — runner bookkeeping outcomes that
//!   callers check by kind rather than treating as fatal.
//! - **Dependency resolution** ([`Error::DependencyMissing`]) — a declared
//!   input is not available yet; propagated unchanged so the engine can retry.
//! - **Restartable sentinel** ([`Error::BrokenConnection`]) — a remote
//!   transport was confirmed broken; restart policies recognize it.
//! - **Opaque worker failure** ([`Error::Worker`]) — anything a worker's main
//!   loop reports that has no structured kind.
//!
//! The enum is `Clone` on purpose: a worker's terminal error must be
//! returnable from every `wait()` call, not just the first one.
//!
//! Each variant has a kind predicate (`is_not_found`, `is_dead`, ...) and a
//! stable snake_case label via [`Error::as_label`] for logs and metrics.

use thiserror::Error;

/// Errors produced by the supervision runtime and its workers.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A configuration or argument failed validation.
    #[error("{0} not valid")]
    NotValid(String),

    /// A worker with this name is already tracked and alive.
    #[error("worker \"{0}\" already exists")]
    AlreadyExists(String),

    /// No tracked worker under this name.
    #[error("worker \"{0}\" not found")]
    NotFound(String),

    /// The runner (or catacomb) the caller is talking to has already died.
    #[error("worker runtime is dead")]
    Dead,

    /// A blocking call gave up because its abort signal fired first.
    #[error("{0} aborted; deadline exceeded")]
    Aborted(String),

    /// A remote transport connection was confirmed broken.
    ///
    /// Sentinel value: restart predicates match it by kind, the way Go code
    /// would use `errors.Is` against a constant error.
    #[error("connection is broken")]
    BrokenConnection,

    /// A declared dependency has not produced its output yet.
    #[error("dependency \"{0}\" missing")]
    DependencyMissing(String),

    /// An otherwise unstructured worker failure.
    #[error("{0}")]
    Worker(String),
}

impl Error {
    /// Short stable snake_case label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::NotValid(_) => "not_valid",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::Dead => "dead",
            Error::Aborted(_) => "aborted",
            Error::BrokenConnection => "broken_connection",
            Error::DependencyMissing(_) => "dependency_missing",
            Error::Worker(_) => "worker_failed",
        }
    }

    pub fn is_not_valid(&self) -> bool {
        matches!(self, Error::NotValid(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Error::Dead)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    pub fn is_broken_connection(&self) -> bool {
        matches!(self, Error::BrokenConnection)
    }

    pub fn is_dependency_missing(&self) -> bool {
        matches!(self, Error::DependencyMissing(_))
    }
}
