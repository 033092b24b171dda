//! RPC dispatch on top of the Siyaq container.
//!
//! A [`Dispatcher`] maps `alias.method` names onto request-scoped
//! [`RpcService`]s, runs each request through a [`Middleware`] chain,
//! disposes the request's [`ServiceContext`](siyaq_container::ServiceContext)
//! and then writes a JSON [`Envelope`] (or a [`CustomResponse`]) to a
//! transport-provided [`ResponseSink`].
//!
//! Transports stay outside this crate: they parse an [`RpcRequest`], create a
//! context from their container and call [`Dispatcher::handle`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod request;
pub mod response;
pub mod service;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherBuilder};
pub use error::{BoxError, Classification, DispatchError, RpcError};
pub use handler::{ErrorHandler, IoNotFound};
pub use middleware::{CallResult, Middleware, Next, RpcCall};
pub use request::{RpcRequest, split_method};
pub use response::{CustomResponse, ENVELOPE_VERSION, Envelope, ErrorBody, JSON_CONTENT_TYPE, ResponseSink, RpcOutput};
pub use service::RpcService;
