//! Instance lifetimes.
//!
//! Each locator owned by a container or context serves exactly one lifetime:
//! - [`Lifetime::Singleton`]: one instance per container, found by walking up
//!   the container tree
//! - [`Lifetime::Service`]: one instance per [`ServiceContext`](crate::ServiceContext)
//! - [`Lifetime::Transient`]: a fresh instance on every lookup
use std::fmt;

/// Which kind of instances a locator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Lives as long as the container that created it.
    ///
    /// Typical uses: connection pools, configuration, route tables.
    Singleton,

    /// Lives as long as one unit of work (usually one request).
    ///
    /// Typical uses: transactions, the current user, request loggers.
    Service,

    /// Never cached.
    Transient,
}

impl Lifetime {
    /// Whether locators of this lifetime memoize instances.
    #[inline]
    pub fn is_cached(&self) -> bool {
        !matches!(self, Lifetime::Transient)
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifetime::Singleton => write!(f, "Singleton"),
            Lifetime::Service => write!(f, "Service"),
            Lifetime::Transient => write!(f, "Transient"),
        }
    }
}
