//! Registration keys.
//!
//! A [`Key<S, T>`] names one way of building a `T` from a scope `S`
//! (a [`Container`](crate::Container) for singletons and transients, a
//! [`ServiceContext`](crate::ServiceContext) for services). Every key
//! carries an explicit [`KeyKind`] chosen when the key is created.
//!
//! # Identity
//! - Constructor keys are identified by the constructed type: two
//!   `Key::<S, Pool>::constructor()` calls produce the same key.
//! - Factory keys get a fresh identity when created. Two factories with
//!   identical closures are different keys; clones share the identity.
//!
//! Keys are cheap to clone and are usually declared once as statics:
//!
//! ```
//! use once_cell::sync::Lazy;
//! use siyaq_container::{Container, Key};
//! use std::sync::Arc;
//!
//! trait Clock: Send + Sync {
//!     fn now(&self) -> u64;
//! }
//!
//! struct Fixed;
//! impl Clock for Fixed {
//!     fn now(&self) -> u64 { 7 }
//! }
//!
//! static CLOCK: Lazy<Key<Container, dyn Clock>> =
//!     Lazy::new(|| Key::factory("clock", |_| Ok(Arc::new(Fixed) as Arc<dyn Clock>)));
//!
//! let container = Container::new();
//! assert_eq!(container.get_singleton(&CLOCK).unwrap().now(), 7);
//! ```

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use siyaq_support::rendering::short_type_name;

use crate::error::{BoxError, Result, SiyaqError};

/// Type-erased instance as stored by interceptors.
///
/// Always wraps an `Arc<T>` so unsized targets (`dyn Trait`) fit.
pub type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) type BuildFn<S> = Arc<dyn Fn(&S) -> std::result::Result<Instance, BoxError> + Send + Sync>;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// A type that knows how to build itself from a scope.
///
/// ```
/// use siyaq_container::{BoxError, Construct, Container, Key};
///
/// struct Settings { workers: usize }
///
/// impl Construct<Container> for Settings {
///     fn construct(_: &Container) -> Result<Self, BoxError> {
///         Ok(Settings { workers: 4 })
///     }
/// }
///
/// let container = Container::new();
/// let key = Key::<Container, Settings>::constructor();
/// assert_eq!(container.get_singleton(&key).unwrap().workers, 4);
/// ```
pub trait Construct<S>: Sized + Send + Sync + 'static {
    fn construct(scope: &S) -> std::result::Result<Self, BoxError>;
}

/// How a key builds its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Built through [`Construct::construct`].
    Constructor,
    /// Built by a closure supplied with the key.
    Factory,
}

/// Identity of a key. Used as the map key by every interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyId {
    Type(TypeId),
    Factory(u64),
}

/// Identity plus the human-facing name of a key.
#[derive(Clone)]
pub struct KeyMeta {
    id: KeyId,
    kind: KeyKind,
    name: &'static str,
}

impl KeyMeta {
    #[inline]
    pub fn id(&self) -> KeyId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// The label given to a factory, or the full type name of a constructor.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for KeyMeta {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KeyMeta {}

impl Hash for KeyMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for KeyMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KeyKind::Constructor => write!(f, "Key({})", self.name),
            KeyKind::Factory => write!(f, "Key({:?}, factory)", self.name),
        }
    }
}

impl fmt::Display for KeyMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KeyKind::Constructor => f.write_str(&short_type_name(self.name)),
            KeyKind::Factory => f.write_str(self.name),
        }
    }
}

/// A key with its output type erased. This is what interceptors see.
pub struct ErasedKey<S> {
    meta: KeyMeta,
    build: BuildFn<S>,
}

impl<S> ErasedKey<S> {
    #[inline]
    pub fn meta(&self) -> &KeyMeta {
        &self.meta
    }

    #[inline]
    pub fn id(&self) -> KeyId {
        self.meta.id
    }

    /// Runs the key's own instantiation strategy, no interceptors involved.
    pub(crate) fn build(&self, scope: &S) -> std::result::Result<Instance, BoxError> {
        (self.build)(scope)
    }
}

impl<S> Clone for ErasedKey<S> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            build: Arc::clone(&self.build),
        }
    }
}

impl<S> fmt::Debug for ErasedKey<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.meta, f)
    }
}

/// Typed registration key producing `Arc<T>` from a scope `S`.
pub struct Key<S, T: ?Sized> {
    erased: ErasedKey<S>,
    _output: PhantomData<fn() -> Arc<T>>,
}

impl<S: 'static, T: Construct<S>> Key<S, T> {
    /// Key that builds `T` through its [`Construct`] impl.
    pub fn constructor() -> Self {
        let build: BuildFn<S> = Arc::new(|scope: &S| {
            let value = T::construct(scope)?;
            Ok(Arc::new(Arc::new(value)) as Instance)
        });

        Self {
            erased: ErasedKey {
                meta: KeyMeta {
                    id: KeyId::Type(TypeId::of::<T>()),
                    kind: KeyKind::Constructor,
                    name: type_name::<T>(),
                },
                build,
            },
            _output: PhantomData,
        }
    }
}

impl<S: 'static, T: ?Sized + Send + Sync + 'static> Key<S, T> {
    /// Key that builds its instance with `factory`.
    ///
    /// `name` only shows up in logs and errors; it does not take part in
    /// identity.
    pub fn factory<F>(name: &'static str, factory: F) -> Self
    where
        F: Fn(&S) -> std::result::Result<Arc<T>, BoxError> + Send + Sync + 'static,
    {
        let build: BuildFn<S> = Arc::new(move |scope: &S| {
            let value = factory(scope)?;
            Ok(Arc::new(value) as Instance)
        });

        Self {
            erased: ErasedKey {
                meta: KeyMeta {
                    id: KeyId::Factory(NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed)),
                    kind: KeyKind::Factory,
                    name,
                },
                build,
            },
            _output: PhantomData,
        }
    }

    #[inline]
    pub fn meta(&self) -> &KeyMeta {
        &self.erased.meta
    }

    #[inline]
    pub fn id(&self) -> KeyId {
        self.erased.meta.id
    }

    #[inline]
    pub fn kind(&self) -> KeyKind {
        self.erased.meta.kind
    }

    #[inline]
    pub fn erased(&self) -> &ErasedKey<S> {
        &self.erased
    }

    /// Recovers the typed handle from an erased instance.
    pub(crate) fn downcast(&self, instance: Instance) -> Result<Arc<T>> {
        instance
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| SiyaqError::TypeMismatch {
                key: self.meta().clone(),
                expected: type_name::<Arc<T>>(),
            })
    }
}

impl<S, T: ?Sized> Clone for Key<S, T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _output: PhantomData,
        }
    }
}

impl<S, T: ?Sized> fmt::Debug for Key<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.erased.meta, f)
    }
}
