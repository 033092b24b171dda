//! The disposal bus.
//!
//! Every container owns a [`ContextEvents`] registry. When a
//! [`ServiceContext`] is torn down, the listeners of its container and of
//! all the container's ancestors run once, root first. Siblings and
//! descendants never see each other's listeners. Listeners are where request
//! cleanup lives: committing or rolling back a transaction, flushing an
//! audit log, releasing a lease.
//!
//! # Protocol
//! 1. Every listener is started with the context and the error that ended
//!    the unit of work (`None` on success).
//! 2. All listeners run concurrently and disposal waits until **each one**
//!    has settled, including after another one failed or panicked.
//! 3. If any failed, disposal fails with the failure of the earliest
//!    listener (root to leaf, then registration order) that failed; the
//!    rest are kept in [`DisposeError::others`].

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::context::ServiceContext;
use crate::error::{BoxError, DisposeError, PanicError, SharedError};

/// Future returned by a dispose listener.
pub type DisposeFuture = BoxFuture<'static, Result<(), BoxError>>;

pub(crate) type Listener = Arc<dyn Fn(ServiceContext, Option<SharedError>) -> DisposeFuture + Send + Sync>;

/// Append-only registry of one container's dispose listeners.
#[derive(Default)]
pub struct ContextEvents {
    listeners: RwLock<Vec<Listener>>,
}

impl ContextEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. There is no way to unregister one.
    pub fn on_dispose<F, Fut>(&self, listener: F)
    where
        F: Fn(ServiceContext, Option<SharedError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |context, error| listener(context, error).boxed());
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        debug!(listeners = listeners.len(), "Registered dispose listener");
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current listeners, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.listeners.read().clone()
    }
}

/// Runs `listeners` for `context` and waits for all of them.
///
/// Called by [`ServiceContext::dispose`], which makes sure this happens once
/// per context. The listeners are a snapshot, so one registering another
/// cannot deadlock the bus.
#[instrument(skip_all, fields(context = %context.id(), failed_request = error.is_some()))]
pub(crate) async fn dispose(
    context: &ServiceContext,
    listeners: Vec<Listener>,
    error: Option<SharedError>,
) -> Result<(), DisposeError> {
    let total = listeners.len();

    let pending = listeners.iter().map(|listener| {
        let started = catch_unwind(AssertUnwindSafe(|| listener(context.clone(), error.clone())));
        async move {
            match started {
                Ok(future) => AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(panic_error(payload.as_ref()))),
                Err(payload) => Err(panic_error(payload.as_ref())),
            }
        }
    });

    let outcomes = join_all(pending).await;

    let mut failures = outcomes
        .into_iter()
        .enumerate()
        .filter_map(|(index, outcome)| outcome.err().map(|err| (index, err)))
        .inspect(|(index, err)| warn!(listener = index, error = %err, "Dispose listener failed"))
        .map(|(_, err)| err);

    match failures.next() {
        None => {
            debug!(listeners = total, "Context disposed");
            Ok(())
        }
        Some(first) => Err(DisposeError {
            context: context.id(),
            total,
            first,
            others: failures.collect(),
        }),
    }
}

fn panic_error(payload: &(dyn std::any::Any + Send)) -> BoxError {
    Box::new(PanicError::from_payload(payload))
}

impl fmt::Debug for ContextEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEvents")
            .field("listeners", &self.len())
            .finish()
    }
}
