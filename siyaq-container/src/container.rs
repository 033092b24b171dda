//! # The Container
//!
//! Application-level node of the locator tree. A container owns
//! - a singleton locator (one instance per key per container),
//! - a service-locator template that every [`ServiceContext`] is derived from,
//! - a transient locator (fresh instance per call),
//! - its own dispose listeners, which also run for its descendants' contexts.
//!
//! # Architecture
//! ```text
//!            Container (root)
//!            │  singletons, service template, transients
//!            │
//!   create_child_container()          create_context()
//!            │                               │
//!            ▼                               ▼
//!     Container (child) ──parent──>    ServiceContext ──dispose()──> ContextEvents
//! ```
//!
//! Singleton lookup walks from the queried container up to the root and
//! returns the first instance found. If no ancestor has one, it is created
//! in the queried container, so a child never leaks instances upwards.
//!
//! # Examples
//! ```rust
//! use siyaq_container::prelude::*;
//! use std::sync::Arc;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String { "hello".into() }
//! }
//!
//! let greeter: Key<Container, dyn Greeter> =
//!     Key::factory("greeter", |_| Ok(Arc::new(English) as Arc<dyn Greeter>));
//!
//! let root = Container::new();
//! let child = root.create_child_container();
//!
//! let from_root = root.get_singleton(&greeter).unwrap();
//! let from_child = child.get_singleton(&greeter).unwrap();
//! assert!(Arc::ptr_eq(&from_root, &from_child));
//! assert_eq!(from_child.greet(), "hello");
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info, instrument, trace, warn};

use crate::context::ServiceContext;
use crate::error::{BoxError, PanicError, Result, ScopeError, SharedError};
use crate::events::{ContextEvents, Listener};
use crate::key::Key;
use crate::lifetime::Lifetime;
use crate::locator::Locator;

struct ContainerInner {
    parent: Option<Container>,
    depth: usize,
    singletons: Locator<Container>,
    services: Locator<ServiceContext>,
    transients: Locator<Container>,
    events: ContextEvents,
}

// ═══════════════════════════════════════════
// Container
// ═══════════════════════════════════════════

/// Thread-safe node of the container tree. Cheap to clone; clones are the
/// same node.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// A root container with empty locators and its own disposal bus.
    pub fn new() -> Self {
        info!("Creating root container");
        Self {
            inner: Arc::new(ContainerInner {
                parent: None,
                depth: 0,
                singletons: Locator::new(Lifetime::Singleton),
                services: Locator::new(Lifetime::Service),
                transients: Locator::new(Lifetime::Transient),
                events: ContextEvents::new(),
            }),
        }
    }

    /// A child with its own singletons and dispose listeners, and a service
    /// template and transient overrides inherited from this container.
    pub fn create_child_container(&self) -> Container {
        let depth = self.inner.depth + 1;
        debug!(depth, "Creating child container");
        Container {
            inner: Arc::new(ContainerInner {
                parent: Some(self.clone()),
                depth,
                singletons: Locator::new(Lifetime::Singleton),
                services: self.inner.services.inherit(),
                transients: self.inner.transients.inherit(),
                events: ContextEvents::new(),
            }),
        }
    }

    #[inline]
    pub fn parent(&self) -> Option<&Container> {
        self.inner.parent.as_ref()
    }

    /// Distance from the root; the root is `0`.
    #[inline]
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    fn ancestors(&self) -> impl Iterator<Item = &Container> {
        std::iter::successors(self.parent(), |c| c.parent())
    }

    // ── Singletons ──

    /// Resolves a singleton.
    ///
    /// Returns the instance of the nearest container (this one included)
    /// that already has `key`; otherwise builds it here. The factory
    /// receives the container that owns the new instance.
    pub fn get_singleton<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>) -> Result<Arc<T>> {
        if !self.has_own_singleton(key) {
            if let Some(owner) = self.ancestors().find(|c| c.has_own_singleton(key)) {
                trace!(key = %key.meta(), depth = owner.depth(), "Found singleton in ancestor");
                return owner.inner.singletons.get(owner, key);
            }
        }
        self.inner.singletons.get(self, key)
    }

    /// Whether this container or an ancestor already has `key`. Never builds.
    pub fn has_singleton<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>) -> bool {
        self.has_own_singleton(key) || self.ancestors().any(|c| c.has_own_singleton(key))
    }

    /// Whether this container itself has an instance or override for `key`.
    pub fn has_own_singleton<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>) -> bool {
        self.inner.singletons.has(key)
    }

    /// Pre-seeds a singleton in this container.
    ///
    /// # Errors
    /// [`SiyaqError::AlreadySet`](crate::SiyaqError::AlreadySet) if this
    /// container already has an instance for `key`.
    pub fn set_singleton<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>, value: Arc<T>) -> Result<()> {
        self.inner.singletons.set(key, value)
    }

    /// Materializes a singleton for its side effects, discarding the value.
    ///
    /// Useful to run plugin initialization in a fixed order at startup.
    pub fn load<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>) -> Result<()> {
        debug!(key = %key.meta(), "Loading singleton");
        self.get_singleton(key).map(drop)
    }

    // ── Transients ──

    /// Builds a fresh instance on every call. Overrides apply, nothing is
    /// cached.
    pub fn transient<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>) -> Result<Arc<T>> {
        self.inner.transients.get(self, key)
    }

    // ── Overrides ──

    pub fn override_singleton<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key<Container, T>,
        replacement: &Key<Container, T>,
    ) {
        self.inner.singletons.override_key(key, replacement);
    }

    /// Overrides a service for contexts created from now on.
    pub fn override_service<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key<ServiceContext, T>,
        replacement: &Key<ServiceContext, T>,
    ) {
        self.inner.services.override_key(key, replacement);
    }

    pub fn override_transient<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key<Container, T>,
        replacement: &Key<Container, T>,
    ) {
        self.inner.transients.override_key(key, replacement);
    }

    /// Drops the singleton, service and transient overrides of this
    /// container. Ancestors and existing contexts keep theirs.
    pub fn clear_overrides(&self) {
        self.inner.singletons.clear_overrides();
        self.inner.services.clear_overrides();
        self.inner.transients.clear_overrides();
    }

    // ── Contexts ──

    pub fn create_context(&self) -> ServiceContext {
        ServiceContext::new(self)
    }

    pub(crate) fn service_template(&self) -> &Locator<ServiceContext> {
        &self.inner.services
    }

    /// Registers a dispose listener for contexts of this container and of
    /// its descendants. Ancestors and siblings never run it.
    pub fn on_dispose<F, Fut>(&self, listener: F)
    where
        F: Fn(ServiceContext, Option<SharedError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.inner.events.on_dispose(listener);
    }

    #[inline]
    pub fn events(&self) -> &ContextEvents {
        &self.inner.events
    }

    /// Listeners that apply to this container's contexts, root first.
    pub(crate) fn dispose_listeners(&self) -> Vec<Listener> {
        let mut chain: Vec<&Container> = self.ancestors().collect();
        chain.reverse();
        chain.push(self);
        chain
            .into_iter()
            .flat_map(|container| container.inner.events.snapshot())
            .collect()
    }

    /// Runs `work` inside a fresh context and disposes it exactly once.
    ///
    /// - `Ok(value)`: listeners see no error; a listener failure turns the
    ///   result into [`ScopeError::Cleanup`].
    /// - `Err(e)`: listeners see `e`, which is returned as
    ///   [`ScopeError::Failed`]. Listener failures are logged.
    /// - panic: listeners see a [`PanicError`], then the panic resumes.
    #[instrument(skip_all, fields(depth = self.inner.depth))]
    pub async fn run_scoped<F, Fut, T, E>(&self, work: F) -> std::result::Result<T, ScopeError>
    where
        F: FnOnce(ServiceContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let context = self.create_context();
        let scoped = context.clone();
        let outcome = AssertUnwindSafe(async move { work(scoped).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                context.dispose(None).await.map_err(ScopeError::Cleanup)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                let boxed: BoxError = err.into();
                let shared: SharedError = Arc::from(boxed);
                if let Err(cleanup) = context.dispose(Some(Arc::clone(&shared))).await {
                    warn!(context = %context.id(), error = %cleanup, "Cleanup after failed unit of work also failed");
                }
                Err(ScopeError::Failed(shared))
            }
            Err(payload) => {
                let panic: SharedError = Arc::new(PanicError::from_payload(payload.as_ref()));
                if let Err(cleanup) = context.dispose(Some(panic)).await {
                    warn!(context = %context.id(), error = %cleanup, "Cleanup after panicked unit of work failed");
                }
                resume_unwind(payload)
            }
        }
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("depth", &self.inner.depth)
            .field("singletons", &self.inner.singletons)
            .field("listeners", &self.inner.events.len())
            .finish()
    }
}

// ═══════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════

pub mod prelude {
    pub use super::Container;
    pub use crate::context::{ContextState, ServiceContext};
    pub use crate::error::{BoxError, Result, ScopeError, SharedError, SiyaqError};
    pub use crate::key::{Construct, Key, KeyKind};
    pub use crate::lifetime::Lifetime;
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════
