//! The generic resolver behind containers and service contexts.
//!
//! A [`Locator<S>`] hands out at most one instance per key for the scope it
//! serves. It does not own the scope object: the owner passes itself in on
//! every call, which keeps containers and contexts free of self-references.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::error::{AlreadySetError, Result, SiyaqError};
use crate::interceptor::{CachingInterceptor, Interceptor, Next, OverrideInterceptor};
use crate::key::{Instance, Key};
use crate::lifetime::Lifetime;

static NEXT_LOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Resolves keys against a scope of type `S`.
///
/// The default chain is `[Caching, Override]` for cached lifetimes and
/// `[Override]` for transients. Interceptors added later wrap the ones
/// added earlier.
pub struct Locator<S> {
    id: u64,
    lifetime: Lifetime,
    interceptors: Vec<Box<dyn Interceptor<S>>>,
}

impl<S: 'static> Locator<S> {
    /// A locator with the standard chain for `lifetime`.
    pub fn new(lifetime: Lifetime) -> Self {
        let locator = Self::bare(lifetime);
        let locator = if lifetime.is_cached() {
            locator.with_interceptor(CachingInterceptor::new())
        } else {
            locator
        };
        locator.with_interceptor(OverrideInterceptor::new())
    }

    /// A locator without interceptors: every lookup builds a new instance.
    pub fn bare(lifetime: Lifetime) -> Self {
        Self {
            id: NEXT_LOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            lifetime,
            interceptors: Vec::new(),
        }
    }

    /// Adds `interceptor` as the new outermost layer.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor<S> + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    #[inline]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Resolves `key` for `scope`.
    ///
    /// Repeated calls return the same `Arc` as long as a caching interceptor
    /// is in the chain. A failed build is not remembered.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self, scope: &S, key: &Key<S, T>) -> Result<Arc<T>> {
        trace!(key = %key.meta(), lifetime = %self.lifetime, "Resolving");
        let instance = self.get_erased(scope, key)?;
        key.downcast(instance)
    }

    fn get_erased<T: ?Sized + Send + Sync + 'static>(&self, scope: &S, key: &Key<S, T>) -> Result<Instance> {
        Next::new(self.id, scope, &self.interceptors).run(key.erased())
    }

    /// Whether `key` already has an instance or an override here.
    ///
    /// Never builds anything.
    pub fn has<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<S, T>) -> bool {
        self.interceptors.iter().any(|i| i.has(key.id()))
    }

    /// Makes every later lookup of `key` resolve to `replacement`'s instance.
    ///
    /// The outermost interceptor that accepts overrides records it; every
    /// interceptor then forgets whatever it cached for `key`.
    pub fn override_key<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<S, T>, replacement: &Key<S, T>) {
        let recorded = self
            .interceptors
            .iter()
            .rev()
            .any(|i| i.register_override(key.meta(), replacement.erased()));

        if recorded {
            for interceptor in &self.interceptors {
                interceptor.forget(key.id());
            }
            debug!(
                from = %key.meta(),
                to = %replacement.meta(),
                lifetime = %self.lifetime,
                "Registered override"
            );
        } else {
            debug!(key = %key.meta(), "No interceptor accepts overrides; ignored");
        }
    }

    /// Stores a pre-built instance for `key`.
    ///
    /// # Errors
    /// [`SiyaqError::AlreadySet`] if `key` already has an instance.
    pub fn set<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<S, T>, value: Arc<T>) -> Result<()> {
        let instance: Instance = Arc::new(value);
        let stored = self
            .interceptors
            .iter()
            .rev()
            .find_map(|i| i.seed(key.meta(), Arc::clone(&instance)));

        match stored {
            Some(true) => {
                debug!(key = %key.meta(), lifetime = %self.lifetime, "Seeded instance");
                Ok(())
            }
            Some(false) | None => Err(SiyaqError::AlreadySet(AlreadySetError {
                key: key.meta().clone(),
                lifetime: self.lifetime,
            })),
        }
    }

    /// Drops every override registered on this locator.
    pub fn clear_overrides(&self) {
        for interceptor in &self.interceptors {
            interceptor.clear();
        }
        debug!(lifetime = %self.lifetime, "Cleared overrides");
    }

    /// A new locator whose interceptors are inherited copies of these:
    /// overrides are carried over as a snapshot, caches start empty.
    pub fn inherit(&self) -> Self {
        Self {
            id: NEXT_LOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            lifetime: self.lifetime,
            interceptors: self.interceptors.iter().map(|i| i.inherit()).collect(),
        }
    }
}

impl<S> fmt::Debug for Locator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locator")
            .field("id", &self.id)
            .field("lifetime", &self.lifetime)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
