//! Dependency resolution: an explicit registry of factories keyed by
//! token.
//!
//! Handlers and sagas that need collaborators (a mailer, a clock, an
//! HTTP client) receive them at composition time through a [`Resolver`]
//! rather than looking them up at runtime. Each token resolves at most
//! once; the built instance is cached and shared. A failed resolution
//! is fatal to startup and never retried.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::ResolveError;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&Resolver) -> Result<Instance, ResolveError> + Send + Sync>;

/// Registry of factories keyed by string token.
///
/// Factories may resolve other tokens through the `&Resolver` they are
/// handed, so an object graph wires itself in dependency order.
#[derive(Default)]
pub struct Resolver {
    factories: HashMap<String, Factory>,
    cache: Mutex<HashMap<String, Instance>>,
}

impl Resolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-built value under a token.
    pub fn provide_value<T: Send + Sync + 'static>(&mut self, token: impl Into<String>, value: T) {
        let instance: Instance = Arc::new(value);
        self.factories.insert(
            token.into(),
            Box::new(move |_| Ok(instance.clone())),
        );
    }

    /// Register a factory under a token.
    ///
    /// The factory runs at most once, on first resolution; subsequent
    /// resolutions return the cached instance.
    pub fn provide<T, F>(&mut self, token: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> Result<T, ResolveError> + Send + Sync + 'static,
    {
        self.factories.insert(
            token.into(),
            Box::new(move |resolver| Ok(Arc::new(factory(resolver)?) as Instance)),
        );
    }

    /// Resolve a token to a shared instance of `T`.
    ///
    /// # Errors
    ///
    /// * [`ResolveError::UnknownToken`] - nothing registered under the
    ///   token.
    /// * [`ResolveError::TypeMismatch`] - the registered instance is not
    ///   a `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self, token: &str) -> Result<Arc<T>, ResolveError> {
        // Fast path: already built.
        if let Some(instance) = self.cache.lock().expect("resolver cache poisoned").get(token) {
            return downcast::<T>(token, instance.clone());
        }

        let factory = self
            .factories
            .get(token)
            .ok_or_else(|| ResolveError::UnknownToken(token.to_owned()))?;
        // The cache lock is not held while the factory runs, so a
        // factory may resolve its own dependencies recursively.
        let instance = factory(self)?;
        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .entry(token.to_owned())
            .or_insert_with(|| instance.clone());
        downcast::<T>(token, instance)
    }
}

fn downcast<T: Send + Sync + 'static>(
    token: &str,
    instance: Instance,
) -> Result<Arc<T>, ResolveError> {
    instance
        .downcast::<T>()
        .map_err(|_| ResolveError::TypeMismatch(token.to_owned()))
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("tokens", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
