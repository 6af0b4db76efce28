//! Manifold declaration and input resolution.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::catacomb::Worker;
use crate::errors::Error;

/// Shared output value published by a started manifold worker.
pub type Output = Arc<dyn Any + Send + Sync>;

/// Resolves a named input to the output of another manifold's worker.
pub trait Getter: Send + Sync {
    /// Raw output for `name`. [`Error::DependencyMissing`] when the input's
    /// worker has not published its output yet — callers must pass that
    /// through untouched.
    fn get_output(&self, name: &str) -> Result<Output, Error>;
}

/// Typed input resolution: downcasts the raw output to `T` and clones it out.
///
/// Outputs are published as `Arc<T>`; `T` is usually itself cheap to clone
/// (an `Arc<dyn Service>` or similar handle).
pub fn get_resource<T>(getter: &dyn Getter, name: &str) -> Result<T, Error>
where
    T: Clone + Send + Sync + 'static,
{
    let output = getter.get_output(name)?;
    match output.downcast::<T>() {
        Ok(value) => Ok((*value).clone()),
        Err(_) => Err(Error::NotValid(format!(
            "output of \"{name}\" has an unexpected type"
        ))),
    }
}

/// Result of a manifold start: the worker plus the output it exposes to
/// dependents, if any.
pub struct StartedWorker {
    pub worker: Box<dyn Worker>,
    pub output: Option<Output>,
}

impl StartedWorker {
    pub fn new(worker: Box<dyn Worker>) -> Self {
        Self {
            worker,
            output: None,
        }
    }

    pub fn with_output<T: Send + Sync + 'static>(mut self, output: T) -> Self {
        self.output = Some(Arc::new(output));
        self
    }
}

/// Start function of a manifold. Must validate its config before resolving
/// inputs, and resolve every input before constructing the worker.
pub type ManifoldStartFn =
    Arc<dyn Fn(Arc<dyn Getter>) -> BoxFuture<'static, Result<StartedWorker, Error>> + Send + Sync>;

/// Declarative unit of worker construction: named inputs plus a start
/// function. The only coupling between independently developed workers is
/// the input names.
#[derive(Clone)]
pub struct Manifold {
    /// Names of the manifolds this worker depends on.
    pub inputs: Vec<String>,
    pub start: ManifoldStartFn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapGetter(HashMap<String, Output>);

    impl Getter for MapGetter {
        fn get_output(&self, name: &str) -> Result<Output, Error> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| Error::DependencyMissing(name.to_string()))
        }
    }

    #[test]
    fn get_resource_downcasts_published_outputs() {
        let mut outputs: HashMap<String, Output> = HashMap::new();
        outputs.insert("greeting".into(), Arc::new(String::from("hello")));
        let getter = MapGetter(outputs);

        let value: String = get_resource(&getter, "greeting").unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn missing_input_propagates_unchanged() {
        let getter = MapGetter(HashMap::new());
        let err = get_resource::<String>(&getter, "absent").unwrap_err();
        assert_eq!(err, Error::DependencyMissing("absent".into()));
    }

    #[test]
    fn wrong_type_is_not_valid_rather_than_missing() {
        let mut outputs: HashMap<String, Output> = HashMap::new();
        outputs.insert("greeting".into(), Arc::new(42u64));
        let getter = MapGetter(outputs);

        let err = get_resource::<String>(&getter, "greeting").unwrap_err();
        assert!(err.is_not_valid());
    }
}
