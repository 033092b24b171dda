//! Service contexts: one per unit of work.
//!
//! A [`ServiceContext`] memoizes services for a single request (or job, or
//! test) and is disposed exactly once when that work ends. Its locator is
//! derived from the container's service template when the context is
//! created, so overrides registered on the container before that moment
//! apply and later ones do not.
//!
//! # States
//! ```text
//! Created ──first lookup──> Active ──dispose()──> Disposing ──> Disposed
//!    └──────────────────────dispose()──────────────────┘
//! ```
//! Lookups keep working while disposing (listeners usually need the very
//! services they clean up) and are rejected once disposed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use anymap2::SendSyncAnyMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::container::Container;
use crate::error::{Result, SharedError, SiyaqError};
use crate::events;
use crate::key::Key;
use crate::locator::Locator;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a context, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle position of a [`ServiceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ContextState {
    Created = 0,
    Active = 1,
    Disposing = 2,
    Disposed = 3,
}

impl ContextState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ContextState::Created,
            1 => ContextState::Active,
            2 => ContextState::Disposing,
            _ => ContextState::Disposed,
        }
    }
}

struct ContextInner {
    id: ContextId,
    container: Container,
    services: Locator<ServiceContext>,
    state: AtomicU8,
    data: RwLock<SendSyncAnyMap>,
}

/// Request-scoped resolution scope. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

impl ServiceContext {
    /// Creates a context for `container`, snapshotting its service overrides.
    pub fn new(container: &Container) -> Self {
        let context = Self {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                container: container.clone(),
                services: container.service_template().inherit(),
                state: AtomicU8::new(ContextState::Created as u8),
                data: RwLock::new(SendSyncAnyMap::new()),
            }),
        };
        trace!(context = %context.id(), "Created service context");
        context
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    #[inline]
    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Resolves a service, building it at most once for this context.
    ///
    /// # Errors
    /// [`SiyaqError::ContextDisposed`] after disposal finished, or whatever
    /// the service's constructor fails with.
    pub fn get_service<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<ServiceContext, T>) -> Result<Arc<T>> {
        self.ensure_usable()?;
        let _ = self.inner.state.compare_exchange(
            ContextState::Created as u8,
            ContextState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.services.get(self, key)
    }

    /// Whether `key` was already built in (or overridden for) this context.
    pub fn has_service<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<ServiceContext, T>) -> bool {
        self.inner.services.has(key)
    }

    /// Overrides a service for this context only.
    ///
    /// # Errors
    /// [`SiyaqError::ContextDisposed`] after disposal finished.
    pub fn override_service<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &Key<ServiceContext, T>,
        replacement: &Key<ServiceContext, T>,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.inner.services.override_key(key, replacement);
        Ok(())
    }

    /// Resolves a singleton through the owning container.
    pub fn get_singleton<T: ?Sized + Send + Sync + 'static>(&self, key: &Key<Container, T>) -> Result<Arc<T>> {
        self.ensure_usable()?;
        self.inner.container.get_singleton(key)
    }

    /// Stores request data and hands back the previous value of the same
    /// type.
    ///
    /// # Errors
    /// [`SiyaqError::ContextDisposed`] after disposal finished.
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) -> Result<Option<T>> {
        self.ensure_usable()?;
        Ok(self.inner.data.write().insert(value))
    }

    /// A copy of the request data of type `T`, if any.
    ///
    /// # Errors
    /// [`SiyaqError::ContextDisposed`] after disposal finished.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Result<Option<T>> {
        self.ensure_usable()?;
        Ok(self.inner.data.read().get::<T>().cloned())
    }

    /// Runs the dispose listeners of the container and its ancestors for
    /// this context.
    ///
    /// `error` is what ended the unit of work, `None` on success. Every
    /// listener settles before this returns.
    ///
    /// # Errors
    /// - [`SiyaqError::AlreadyDisposed`] on a second call; listeners do not
    ///   run again
    /// - [`SiyaqError::Dispose`] if any listener failed
    pub async fn dispose(&self, error: Option<SharedError>) -> Result<()> {
        self.begin_disposal()?;
        debug!(context = %self.id(), failed_request = error.is_some(), "Disposing service context");

        let listeners = self.inner.container.dispose_listeners();
        let outcome = events::dispose(self, listeners, error).await;

        self.inner
            .state
            .store(ContextState::Disposed as u8, Ordering::Release);
        outcome.map_err(SiyaqError::from)
    }

    fn begin_disposal(&self) -> Result<()> {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= ContextState::Disposing as u8 {
                return Err(SiyaqError::AlreadyDisposed(self.id()));
            }
            match self.inner.state.compare_exchange_weak(
                current,
                ContextState::Disposing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state() == ContextState::Disposed {
            return Err(SiyaqError::ContextDisposed(self.id()));
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
