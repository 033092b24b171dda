//! Middleware around RPC dispatch.
//!
//! Middleware form an onion around the dispatcher's core step (validate,
//! resolve the service, call the method). The middleware registered
//! **last** is the outermost one.
//!
//! ```text
//! handle ──> [auth] ──> [timing] ──> core step
//!            added last   added first
//! ```
//!
//! A middleware may
//! - run code before and after [`Next::run`],
//! - replace or transform the result,
//! - short-circuit by returning `Ok(None)` without calling `next`; the
//!   context is still disposed but no response is written,
//! - fail, which sends the request down the failure path.

use std::sync::Arc;

use async_trait::async_trait;
use siyaq_container::ServiceContext;

use crate::dispatcher::Dispatcher;
use crate::error::BoxError;
use crate::request::RpcRequest;
use crate::response::RpcOutput;

/// Result of a middleware or of the core step. `None` means "no response".
pub type CallResult = Result<Option<RpcOutput>, BoxError>;

/// One request travelling through the chain.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub context: ServiceContext,
    pub request: RpcRequest,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, call: RpcCall, next: Next<'_>) -> CallResult;
}

/// The rest of the chain, ending in the dispatcher's core step.
pub struct Next<'a> {
    dispatcher: &'a Dispatcher,
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { dispatcher, chain }
    }

    /// The dispatcher handling this call, for its config and aliases.
    #[inline]
    pub fn dispatcher(&self) -> &'a Dispatcher {
        self.dispatcher
    }

    pub async fn run(self, call: RpcCall) -> CallResult {
        match self.chain.split_last() {
            Some((outer, inner)) => {
                outer
                    .handle(
                        call,
                        Next {
                            dispatcher: self.dispatcher,
                            chain: inner,
                        },
                    )
                    .await
            }
            None => self.dispatcher.invoke(call).await,
        }
    }
}
