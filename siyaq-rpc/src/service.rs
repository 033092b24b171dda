//! Services callable over RPC.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use siyaq_container::{Key, KeyMeta, ServiceContext, SiyaqError};

use crate::error::BoxError;
use crate::response::RpcOutput;

/// A request-scoped service exposing named methods.
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use siyaq_rpc::{BoxError, RpcOutput, RpcService};
///
/// struct Health;
///
/// #[async_trait]
/// impl RpcService for Health {
///     fn methods(&self) -> &'static [&'static str] {
///         &["ping"]
///     }
///
///     async fn call(&self, _method: &str, _params: Value) -> Result<RpcOutput, BoxError> {
///         Ok(Value::from("pong").into())
///     }
/// }
/// ```
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Names of the callable methods.
    fn methods(&self) -> &'static [&'static str];

    fn has_method(&self, method: &str) -> bool {
        self.methods().contains(&method)
    }

    /// Runs `method`. Only called for names [`has_method`](Self::has_method)
    /// accepted.
    async fn call(&self, method: &str, params: Value) -> Result<RpcOutput, BoxError>;
}

pub(crate) type PendingCall = BoxFuture<'static, Result<RpcOutput, BoxError>>;

type Invoke = dyn Fn(&ServiceContext, &str, Value) -> Result<Option<PendingCall>, SiyaqError> + Send + Sync;

/// A registered alias: resolves its service through the request's context.
#[derive(Clone)]
pub(crate) struct Route {
    service: KeyMeta,
    invoke: Arc<Invoke>,
}

impl Route {
    pub(crate) fn new<T>(key: Key<ServiceContext, T>) -> Self
    where
        T: ?Sized + RpcService + 'static,
    {
        let service = key.meta().clone();
        let invoke = move |context: &ServiceContext,
                           method: &str,
                           params: Value|
              -> Result<Option<PendingCall>, SiyaqError> {
            let instance = context.get_service(&key)?;
            if !instance.has_method(method) {
                return Ok(None);
            }
            let method = method.to_owned();
            let pending: PendingCall = async move { instance.call(&method, params).await }.boxed();
            Ok(Some(pending))
        };
        Self {
            service,
            invoke: Arc::new(invoke),
        }
    }

    #[inline]
    pub(crate) fn service(&self) -> &KeyMeta {
        &self.service
    }

    /// Resolves the service and starts the call. `Ok(None)` if the service
    /// has no such method.
    pub(crate) fn invoke(
        &self,
        context: &ServiceContext,
        method: &str,
        params: Value,
    ) -> Result<Option<PendingCall>, SiyaqError> {
        (self.invoke)(context, method, params)
    }
}
