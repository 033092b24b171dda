//! Error types for Siyaq container operations.
//!
//! Configuration mistakes (a second `set`, a dependency cycle) are reported
//! with the offending key and a hint. Failures raised by user factories are
//! wrapped once with the key that was being built.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use siyaq_support::rendering::render_path;

use crate::context::ContextId;
use crate::key::KeyMeta;
use crate::lifetime::Lifetime;

/// Boxed error crossing user code (factories, listeners, services).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error shared between several consumers, e.g. every dispose listener.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for all Siyaq container operations.
#[derive(Debug, thiserror::Error)]
pub enum SiyaqError {
    /// A key asked for itself while it was being built.
    #[error("{}", .0)]
    CircularDependency(CircularDependencyError),

    /// A constructor or factory returned an error.
    #[error("Failed to construct {key}: {source}")]
    ConstructionFailed {
        key: KeyMeta,
        #[source]
        source: BoxError,
    },

    /// An interceptor handed back an instance of the wrong type.
    #[error("Type mismatch for {key}: expected {expected}")]
    TypeMismatch { key: KeyMeta, expected: &'static str },

    /// `set` was called for a key that already has an instance.
    #[error("{}", .0)]
    AlreadySet(AlreadySetError),

    /// The context finished disposal and must not be used again.
    #[error("Service context {0} is disposed")]
    ContextDisposed(ContextId),

    /// `dispose` was called a second time.
    #[error("Service context {0} was already disposed")]
    AlreadyDisposed(ContextId),

    /// One or more dispose listeners failed.
    #[error(transparent)]
    Dispose(#[from] DisposeError),
}

impl SiyaqError {
    /// Wraps a factory failure, letting cycle reports through untouched so the
    /// outermost caller sees the full path instead of nested wrappers.
    pub(crate) fn construction(key: KeyMeta, source: BoxError) -> Self {
        match source.downcast::<SiyaqError>() {
            Ok(inner) if matches!(*inner, SiyaqError::CircularDependency(_)) => *inner,
            Ok(inner) => SiyaqError::ConstructionFailed { key, source: inner },
            Err(source) => SiyaqError::ConstructionFailed { key, source },
        }
    }
}

/// A key re-entered its own construction.
#[derive(Debug)]
pub struct CircularDependencyError {
    /// Keys from the first occurrence of the repeated key up to the repeat.
    pub chain: Vec<KeyMeta>,
}

impl fmt::Display for CircularDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.chain.iter().map(ToString::to_string).collect();
        write!(f, "Circular dependency detected:\n  {}", render_path(&names))?;
        write!(
            f,
            "\n  Hint: resolve one side lazily, inside a method instead of the constructor"
        )
    }
}

/// A pre-seeded instance collided with an existing one.
#[derive(Debug)]
pub struct AlreadySetError {
    pub key: KeyMeta,
    pub lifetime: Lifetime,
}

impl fmt::Display for AlreadySetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is already set: {}", self.lifetime, self.key)?;
        write!(
            f,
            "\n  Hint: seed instances before the first lookup, or register an override instead"
        )
    }
}

/// Aggregated dispose-listener failures.
///
/// Raised only after every listener has settled. `first` is the failure
/// of the earliest registered listener that failed.
#[derive(Debug, thiserror::Error)]
#[error("{failed} of {total} dispose listener(s) failed for context {context}: {first}", failed = .others.len() + 1)]
pub struct DisposeError {
    pub context: ContextId,
    pub total: usize,
    #[source]
    pub first: BoxError,
    pub others: Vec<BoxError>,
}

impl DisposeError {
    /// Number of listeners that failed.
    pub fn failed(&self) -> usize {
        self.others.len() + 1
    }
}

/// A panic caught at a cleanup boundary, turned into an ordinary error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

impl PanicError {
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self { message }
    }
}

/// Failure of [`Container::run_scoped`](crate::Container::run_scoped).
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// The unit of work failed. The same error was handed to every listener.
    #[error(transparent)]
    Failed(SharedError),

    /// The unit of work succeeded but its cleanup did not.
    #[error(transparent)]
    Cleanup(SiyaqError),
}

/// Convenient Result type for Siyaq container operations.
pub type Result<T> = std::result::Result<T, SiyaqError>;
