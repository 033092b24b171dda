//! Interceptors: composable hooks around instantiation.
//!
//! A [`Locator`](crate::Locator) keeps an ordered list of interceptors and
//! runs them as an onion around the key's own build strategy. The
//! interceptor added **last** is the outermost one: it sees every lookup
//! first and may answer it without consulting the inner ones.
//!
//! ```text
//! get(K) ──> [Override] ──K→B──> [Caching] ──miss──> build(B)
//!  outermost (added last)          innermost (added first)
//! ```
//!
//! Besides `get`, interceptors may answer `has`, accept override
//! registrations, accept pre-seeded instances, and produce a fresh copy of
//! themselves for a derived scope via [`Interceptor::inherit`].

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Result, SiyaqError};
use crate::key::{ErasedKey, Instance, Key, KeyId, KeyMeta};
use crate::resolution;

/// The rest of the chain, handed to [`Interceptor::get`].
pub struct Next<'a, S> {
    locator: u64,
    scope: &'a S,
    chain: &'a [Box<dyn Interceptor<S>>],
}

impl<'a, S> Next<'a, S> {
    pub(crate) fn new(locator: u64, scope: &'a S, chain: &'a [Box<dyn Interceptor<S>>]) -> Self {
        Self { locator, scope, chain }
    }

    /// The scope object the lookup runs against.
    #[inline]
    pub fn scope(&self) -> &'a S {
        self.scope
    }

    /// Identity of the locator running this lookup.
    #[inline]
    pub fn locator(&self) -> u64 {
        self.locator
    }

    /// Resolves `key` through the remaining (inner) interceptors, ending in
    /// the key's own build strategy.
    pub fn run(&self, key: &ErasedKey<S>) -> Result<Instance> {
        match self.chain.split_last() {
            Some((outer, inner)) => outer.get(
                key,
                Next {
                    locator: self.locator,
                    scope: self.scope,
                    chain: inner,
                },
            ),
            None => {
                let _frame = resolution::enter(self.locator, key.meta())?;
                trace!(key = %key.meta(), kind = ?key.meta().kind(), "Instantiating");
                key.build(self.scope)
                    .map_err(|source| SiyaqError::construction(key.meta().clone(), source))
            }
        }
    }
}

/// A hook applied around raw instantiation.
///
/// Only [`get`](Interceptor::get) and [`inherit`](Interceptor::inherit) are
/// mandatory; the remaining hooks default to "not my concern".
pub trait Interceptor<S>: Send + Sync {
    /// Produces the instance for `key`, usually by delegating to `next`.
    fn get(&self, key: &ErasedKey<S>, next: Next<'_, S>) -> Result<Instance>;

    /// Whether this interceptor already knows `key` (cached or redirected).
    fn has(&self, _key: KeyId) -> bool {
        false
    }

    /// Offers an override registration. Returns `true` if it was recorded.
    fn register_override(&self, _key: &KeyMeta, _replacement: &ErasedKey<S>) -> bool {
        false
    }

    /// Told after an override for `key` was recorded anywhere in the chain.
    fn forget(&self, _key: KeyId) {}

    /// Offers a pre-built instance. `None` if this interceptor does not
    /// store instances, `Some(false)` if one was already present.
    fn seed(&self, _key: &KeyMeta, _instance: Instance) -> Option<bool> {
        None
    }

    /// Drops every override this interceptor recorded.
    fn clear(&self) {}

    /// A copy of this interceptor for a derived scope.
    fn inherit(&self) -> Box<dyn Interceptor<S>>;
}

// ═══════════════════════════════════════════
// CachingInterceptor
// ═══════════════════════════════════════════

/// Memoizes one instance per key.
///
/// Each key gets its own [`OnceCell`], so concurrent first lookups of the
/// same key build it once and everyone else waits for that result. A failed
/// build leaves the cell empty and the next lookup retries.
///
/// Inherited copies start empty.
#[derive(Default)]
pub struct CachingInterceptor {
    cells: DashMap<KeyId, Arc<OnceCell<Instance>>>,
}

impl CachingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of materialized instances.
    pub fn len(&self) -> usize {
        self.cells.iter().filter(|cell| cell.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, key: KeyId) -> Option<Instance> {
        self.cells.get(&key).and_then(|cell| cell.get().cloned())
    }

    fn cell(&self, key: KeyId) -> Arc<OnceCell<Instance>> {
        Arc::clone(&self.cells.entry(key).or_default())
    }
}

impl<S> Interceptor<S> for CachingInterceptor {
    fn get(&self, key: &ErasedKey<S>, next: Next<'_, S>) -> Result<Instance> {
        if let Some(instance) = self.cached(key.id()) {
            trace!(key = %key.meta(), "Cache hit");
            return Ok(instance);
        }

        // Waiting on our own cell from inside its initializer would hang.
        resolution::check(next.locator(), key.meta())?;

        let cell = self.cell(key.id());
        cell.get_or_try_init(|| next.run(key)).cloned()
    }

    fn has(&self, key: KeyId) -> bool {
        self.cached(key).is_some()
    }

    fn forget(&self, key: KeyId) {
        self.cells.remove(&key);
    }

    fn seed(&self, key: &KeyMeta, instance: Instance) -> Option<bool> {
        Some(self.cell(key.id()).set(instance).is_ok())
    }

    fn inherit(&self) -> Box<dyn Interceptor<S>> {
        Box::new(CachingInterceptor::new())
    }
}

// ═══════════════════════════════════════════
// OverrideInterceptor
// ═══════════════════════════════════════════

type OverrideMap<S> = Arc<HashMap<KeyId, ErasedKey<S>>>;

/// Redirects keys to replacement keys.
///
/// The map is copy-on-write: an inherited interceptor starts from a
/// snapshot of the parent's map, and later overrides on either side stay
/// on that side.
pub struct OverrideInterceptor<S> {
    overrides: RwLock<OverrideMap<S>>,
}

impl<S: 'static> OverrideInterceptor<S> {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Builder form of [`Interceptor::register_override`] for typed keys.
    pub fn with<T: ?Sized + Send + Sync + 'static>(self, key: &Key<S, T>, replacement: &Key<S, T>) -> Self {
        self.insert(key.meta(), replacement.erased());
        self
    }

    /// Number of redirected keys.
    pub fn len(&self) -> usize {
        self.overrides.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &KeyMeta, replacement: &ErasedKey<S>) {
        let mut guard = self.overrides.write();
        Arc::make_mut(&mut guard).insert(key.id(), replacement.clone());
    }

    fn target(&self, key: KeyId) -> Option<ErasedKey<S>> {
        self.overrides.read().get(&key).cloned()
    }
}

impl<S: 'static> Default for OverrideInterceptor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> Interceptor<S> for OverrideInterceptor<S> {
    fn get(&self, key: &ErasedKey<S>, next: Next<'_, S>) -> Result<Instance> {
        match self.target(key.id()) {
            Some(replacement) => {
                trace!(from = %key.meta(), to = %replacement.meta(), "Following override");
                next.run(&replacement)
            }
            None => next.run(key),
        }
    }

    fn has(&self, key: KeyId) -> bool {
        self.overrides.read().contains_key(&key)
    }

    fn register_override(&self, key: &KeyMeta, replacement: &ErasedKey<S>) -> bool {
        self.insert(key, replacement);
        true
    }

    fn clear(&self) {
        *self.overrides.write() = Arc::new(HashMap::new());
    }

    fn inherit(&self) -> Box<dyn Interceptor<S>> {
        Box::new(OverrideInterceptor {
            overrides: RwLock::new(Arc::clone(&self.overrides.read())),
        })
    }
}
