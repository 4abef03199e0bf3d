//! Resource resolution boundary.
//!
//! The engine needs exactly two things from its host: typed lookup of
//! resources ([`ResourceResolver::resolve_any`], surfaced as
//! [`resolve`](trait.ResourceResolver.html#method.resolve)) and creation of
//! scoped child resolvers ([`ResourceResolver::create_scope`]). Anything that
//! implements [`ResourceResolver`] can back a pipeline.
//!
//! [`ServiceProvider`] is the bundled implementation: resources are
//! registered with explicit factory functions and one of three lifetimes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::PipelineError;

/// A type-erased, shareable resource instance.
pub type AnyResource = Arc<dyn Any + Send + Sync>;

/// Typed resource lookup plus scope creation.
pub trait ResourceResolver: Send + Sync {
    /// Returns the instance registered for `type_id`.
    ///
    /// Fails with [`PipelineError::ServiceNotFound`] when nothing is
    /// registered.
    fn resolve_any(&self, type_id: TypeId, type_name: &'static str) -> Result<AnyResource, PipelineError>;

    /// Creates a child scope. Scoped resources resolved through the returned
    /// handle live until the handle is released.
    fn create_scope(&self) -> ResourceScope;
}

impl dyn ResourceResolver {
    /// Resolves a resource of type `T`.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, PipelineError> {
        let type_name = std::any::type_name::<T>();
        self.resolve_any(TypeId::of::<T>(), type_name)?
            .downcast::<T>()
            .map_err(|_| PipelineError::ServiceNotFound { type_name })
    }
}

// ---------------------------------------------------------------------------
// Scope handles
// ---------------------------------------------------------------------------

/// A scoped resolver plus the release action that ends the scope.
///
/// Release runs exactly once: either explicitly through
/// [`ResourceScope::release`] or when the handle is dropped.
pub struct ResourceScope {
    resolver: Arc<dyn ResourceResolver>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ResourceScope {
    /// Creates a scope handle from a resolver and its release action.
    pub fn new(resolver: Arc<dyn ResourceResolver>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            resolver,
            release: Some(Box::new(release)),
        }
    }

    /// The resolver that serves this scope.
    pub fn resolver(&self) -> Arc<dyn ResourceResolver> {
        Arc::clone(&self.resolver)
    }

    /// Ends the scope now.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.run_release();
    }
}

// ---------------------------------------------------------------------------
// Bundled implementation
// ---------------------------------------------------------------------------

/// How long a registered resource instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance for the root provider and every scope.
    Singleton,
    /// One instance per scope (the root provider acts as its own scope).
    Scoped,
    /// A new instance for every resolution.
    Transient,
}

type Factory = Arc<dyn Fn(&dyn ResourceResolver) -> AnyResource + Send + Sync>;

#[derive(Clone)]
struct Registration {
    lifetime: Lifetime,
    factory: Factory,
}

/// Collects registrations before they are frozen into a [`ServiceProvider`].
#[derive(Default)]
pub struct ServiceCollection {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing instance as a singleton.
    pub fn add_instance<T: Any + Send + Sync>(&mut self, instance: T) -> &mut Self {
        let instance: AnyResource = Arc::new(instance);
        self.add_factory::<T>(Lifetime::Singleton, move |_| Arc::clone(&instance))
    }

    /// Registers a singleton created on first resolution.
    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&dyn ResourceResolver) -> T + Send + Sync + 'static,
    {
        self.add_factory::<T>(Lifetime::Singleton, move |r| Arc::new(factory(r)))
    }

    /// Registers a resource created once per scope.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&dyn ResourceResolver) -> T + Send + Sync + 'static,
    {
        self.add_factory::<T>(Lifetime::Scoped, move |r| Arc::new(factory(r)))
    }

    /// Registers a resource created on every resolution.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&dyn ResourceResolver) -> T + Send + Sync + 'static,
    {
        self.add_factory::<T>(Lifetime::Transient, move |r| Arc::new(factory(r)))
    }

    fn add_factory<T: Any>(
        &mut self,
        lifetime: Lifetime,
        factory: impl Fn(&dyn ResourceResolver) -> AnyResource + Send + Sync + 'static,
    ) -> &mut Self {
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration {
                lifetime,
                factory: Arc::new(factory),
            },
        );
        self
    }

    /// Freezes the registrations into a root provider.
    pub fn build(self) -> Arc<ServiceProvider> {
        let root = Arc::new(RootState {
            registrations: self.registrations,
            singletons: Mutex::new(HashMap::new()),
            open_scopes: AtomicUsize::new(0),
        });
        Arc::new(ServiceProvider {
            root,
            scoped: Mutex::new(HashMap::new()),
        })
    }
}

struct RootState {
    registrations: HashMap<TypeId, Registration>,
    singletons: Mutex<HashMap<TypeId, AnyResource>>,
    open_scopes: AtomicUsize,
}

/// Factory-based [`ResourceResolver`].
///
/// The value returned by [`ServiceCollection::build`] is the root provider;
/// [`ResourceResolver::create_scope`] hands out child providers that share
/// singletons with the root but keep their own scoped instances.
pub struct ServiceProvider {
    root: Arc<RootState>,
    scoped: Mutex<HashMap<TypeId, AnyResource>>,
}

impl ServiceProvider {
    /// A provider with no registrations.
    pub fn empty() -> Arc<Self> {
        ServiceCollection::new().build()
    }

    /// Number of scopes created from this provider tree that have not been
    /// released yet.
    pub fn open_scopes(&self) -> usize {
        self.root.open_scopes.load(Ordering::SeqCst)
    }
}

impl ResourceResolver for ServiceProvider {
    fn resolve_any(&self, type_id: TypeId, type_name: &'static str) -> Result<AnyResource, PipelineError> {
        let registration = self
            .root
            .registrations
            .get(&type_id)
            .ok_or(PipelineError::ServiceNotFound { type_name })?;

        let cache = match registration.lifetime {
            Lifetime::Transient => return Ok((registration.factory)(self)),
            Lifetime::Singleton => &self.root.singletons,
            Lifetime::Scoped => &self.scoped,
        };
        if let Some(existing) = cache.lock().get(&type_id) {
            return Ok(Arc::clone(existing));
        }
        // Factories may resolve other resources, so the lock is not held while
        // creating; the first instance to be stored wins.
        let created = (registration.factory)(self);
        Ok(Arc::clone(cache.lock().entry(type_id).or_insert(created)))
    }

    fn create_scope(&self) -> ResourceScope {
        self.root.open_scopes.fetch_add(1, Ordering::SeqCst);
        let child = Arc::new(ServiceProvider {
            root: Arc::clone(&self.root),
            scoped: Mutex::new(HashMap::new()),
        });
        let root = Arc::clone(&self.root);
        let released = Arc::clone(&child);
        ResourceScope::new(child, move || {
            released.scoped.lock().clear();
            root.open_scopes.fetch_sub(1, Ordering::SeqCst);
        })
    }
}
