//! # Siyaq — Hierarchical Service Locator for Rust
//!
//! Typed keys, a tree of containers holding singletons, request-scoped
//! service contexts with disposal hooks, and an RPC dispatcher that ties a
//! request's lifecycle to its context.
//!
//! ```
//! use std::sync::Arc;
//! use siyaq::prelude::*;
//!
//! struct Clock;
//!
//! impl Construct<Container> for Clock {
//!     fn construct(_: &Container) -> Result<Self, BoxError> {
//!         Ok(Clock)
//!     }
//! }
//!
//! let clock = Key::<Container, Clock>::constructor();
//! let root = Container::new();
//! let child = root.create_child_container();
//!
//! root.load(&clock).unwrap();
//! assert!(Arc::ptr_eq(
//!     &root.get_singleton(&clock).unwrap(),
//!     &child.get_singleton(&clock).unwrap(),
//! ));
//! ```
//!
//! The building blocks live in their own crates and are re-exported here:
//! [`container`] for the resolution engine, [`rpc`] for dispatch and
//! [`support`] for diagnostics and tracing setup.

pub use siyaq_container as container;
pub use siyaq_rpc as rpc;
pub use siyaq_support as support;

pub use siyaq_container::{
    Container, ContextState, Key, KeyKind, Lifetime, ScopeError, ServiceContext, SharedError, SiyaqError,
};
pub use siyaq_rpc::{Dispatcher, DispatcherConfig, RpcError, RpcRequest, RpcService};

/// Everything an application usually needs, in one import.
pub mod prelude {
    pub use siyaq_container::{BoxError, Construct, Container, ContextState, Key, KeyKind, Lifetime, ServiceContext};
    pub use siyaq_rpc::{
        Classification, CustomResponse, DispatchOutcome, Dispatcher, DispatcherConfig, Middleware, ResponseSink,
        RpcCall, RpcError, RpcOutput, RpcRequest, RpcService,
    };
    pub use siyaq_support::telemetry::init_tracing;
}
