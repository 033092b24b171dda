//! Core resolution engine for Siyaq.
//!
//! [`Container`]s hold singletons and form a tree, [`ServiceContext`]s hold
//! request-scoped services and are disposed once per unit of work, and both
//! resolve through a [`Locator`] built from composable [`Interceptor`]s.

pub mod container;
pub mod context;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod key;
pub mod lifetime;
pub mod locator;
mod resolution;

pub use container::{Container, prelude};
pub use context::{ContextId, ContextState, ServiceContext};
pub use error::{
    AlreadySetError, BoxError, CircularDependencyError, DisposeError, PanicError, Result, ScopeError, SharedError,
    SiyaqError,
};
pub use events::{ContextEvents, DisposeFuture};
pub use interceptor::{CachingInterceptor, Interceptor, Next, OverrideInterceptor};
pub use key::{Construct, ErasedKey, Instance, Key, KeyId, KeyKind, KeyMeta};
pub use lifetime::Lifetime;
pub use locator::Locator;
