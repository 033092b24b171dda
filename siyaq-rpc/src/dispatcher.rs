//! # The Dispatcher
//!
//! Maps `alias.method` requests onto registered services and owns the
//! request lifecycle:
//!
//! ```text
//! handle(context, request, sink)
//!   │
//!   ├─ middleware chain ─> core step: validate → resolve service → call
//!   │
//!   ├─ success:  dispose(None)  ─┬─ ok ──> write result / custom response
//!   │                            └─ err ─> failure path
//!   └─ failure:  dispose(error) ───────> classify ──> write error envelope
//! ```
//!
//! The context is disposed exactly once per request and always before
//! anything is written, so listeners (commit, rollback) have finished by the
//! time the client sees the outcome.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::error::Error as StdError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use siyaq_container::{Key, PanicError, ServiceContext, SharedError};
use siyaq_support::rendering::closest_matches;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{
    BoxError, Classification, DispatchError, MISSING_METHOD, MISSING_PARAMS, ProtocolError, RpcError,
};
use crate::handler::ErrorHandler;
use crate::middleware::{CallResult, Middleware, Next, RpcCall};
use crate::request::{RpcRequest, split_method};
use crate::response::{Envelope, ResponseSink, RpcOutput};
use crate::service::{Route, RpcService};

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A success response was written (envelope or custom).
    Succeeded,
    /// An error envelope with this status was written.
    Failed { status: u16 },
    /// A middleware answered `None`; nothing was written.
    ShortCircuited,
}

impl DispatchOutcome {
    /// The status written to the sink, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchOutcome::Succeeded => Some(200),
            DispatchOutcome::Failed { status } => Some(*status),
            DispatchOutcome::ShortCircuited => None,
        }
    }
}

// ═══════════════════════════════════════════
// DispatcherBuilder
// ═══════════════════════════════════════════

/// Builds a [`Dispatcher`] with its config, handlers and middleware.
///
/// ```
/// use siyaq_rpc::{Classification, Dispatcher, DispatcherConfig};
///
/// let dispatcher = Dispatcher::builder()
///     .config(DispatcherConfig {
///         log_client_errors: true,
///         ..DispatcherConfig::default()
///     })
///     .on_error(|err| {
///         err.to_string()
///             .starts_with("locked")
///             .then(|| Classification::new(423, "Resource locked"))
///     })
///     .build();
/// assert!(dispatcher.aliases().is_empty());
/// ```
#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    handlers: Vec<Arc<dyn ErrorHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Closure form of [`error_handler`](Self::error_handler).
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> Option<Classification> + Send + Sync + 'static,
    {
        self.error_handler(handler)
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Dispatcher {
        info!(
            handlers = self.handlers.len(),
            middleware = self.middleware.len(),
            "Building dispatcher"
        );
        Dispatcher {
            config: self.config,
            routes: RwLock::new(HashMap::new()),
            handlers: RwLock::new(self.handlers),
            middleware: RwLock::new(self.middleware),
        }
    }
}

// ═══════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════

/// Thread-safe RPC dispatcher. Share it behind an `Arc`.
pub struct Dispatcher {
    config: DispatcherConfig,
    routes: RwLock<HashMap<String, Route>>,
    handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    #[inline]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // ── Registration ──

    /// Exposes the service behind `key` under `alias`.
    ///
    /// The service is resolved through each request's context, so it is
    /// built at most once per request.
    ///
    /// # Errors
    /// [`DispatchError::DuplicateAlias`] if `alias` is taken.
    pub fn register<T>(&self, alias: impl Into<String>, key: Key<ServiceContext, T>) -> Result<(), DispatchError>
    where
        T: ?Sized + RpcService + 'static,
    {
        let mut routes = self.routes.write();
        match routes.entry(alias.into()) {
            Entry::Occupied(taken) => Err(DispatchError::DuplicateAlias {
                alias: taken.key().clone(),
            }),
            Entry::Vacant(slot) => {
                debug!(alias = %slot.key(), service = %key.meta(), "Registered RPC service");
                slot.insert(Route::new(key));
                Ok(())
            }
        }
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.routes.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Adds an error handler that takes priority over every earlier one.
    pub fn add_error_handler(&self, handler: impl ErrorHandler + 'static) {
        let mut handlers = self.handlers.write();
        handlers.push(Arc::new(handler));
        debug!(handlers = handlers.len(), "Registered error handler");
    }

    /// Adds a middleware that wraps every earlier one.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        let mut chain = self.middleware.write();
        chain.push(Arc::new(middleware));
        debug!(middleware = chain.len(), "Registered middleware");
    }

    // ── Dispatch ──

    /// Handles one request and disposes `context`.
    ///
    /// Request failures never surface here; they become error envelopes.
    ///
    /// # Errors
    /// Only if writing to `sink` fails.
    #[instrument(
        skip_all,
        fields(context = %context.id(), method = request.method.as_deref().unwrap_or("-"))
    )]
    pub async fn handle(
        &self,
        context: ServiceContext,
        request: RpcRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<DispatchOutcome, BoxError> {
        let chain: Vec<Arc<dyn Middleware>> = self.middleware.read().clone();
        let call = RpcCall {
            context: context.clone(),
            request,
        };

        match self.run_chain(&chain, call).await {
            Ok(output) => match context.dispose(None).await {
                Ok(()) => match output {
                    Some(output) => self.respond(output, sink).await,
                    None => {
                        debug!("Middleware short-circuited; nothing written");
                        Ok(DispatchOutcome::ShortCircuited)
                    }
                },
                Err(cleanup) => {
                    let failure: SharedError = Arc::new(cleanup);
                    self.fail(&failure, sink).await
                }
            },
            Err(err) => {
                let failure: SharedError = Arc::from(err);
                if let Err(cleanup) = context.dispose(Some(Arc::clone(&failure))).await {
                    warn!(error = %cleanup, "Disposing a failed request also failed");
                }
                self.fail(&failure, sink).await
            }
        }
    }

    async fn run_chain(&self, chain: &[Arc<dyn Middleware>], call: RpcCall) -> CallResult {
        let run = Next::new(self, chain).run(call);
        if !self.config.catch_panics {
            return run.await;
        }
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let panic = PanicError::from_payload(payload.as_ref());
                error!(panic = %panic.message, "RPC call panicked");
                Err(panic.into())
            }
        }
    }

    /// The innermost step of the chain.
    pub(crate) async fn invoke(&self, call: RpcCall) -> CallResult {
        let RpcCall { context, request } = call;
        let method = request.method.ok_or_else(|| ProtocolError::bad_request(MISSING_METHOD))?;
        let params = request.params.ok_or_else(|| ProtocolError::bad_request(MISSING_PARAMS))?;

        let Some((alias, name)) = split_method(&method) else {
            debug!(method = %method, "Method name has no alias");
            return Err(ProtocolError::not_found().into());
        };

        let route = self.routes.read().get(alias).cloned();
        let Some(route) = route else {
            let aliases = self.aliases();
            let hints = closest_matches(alias, aliases.iter().map(String::as_str), 3);
            debug!(alias, ?hints, "Unknown service alias");
            return Err(ProtocolError::not_found().into());
        };

        trace!(alias, method = name, service = %route.service(), "Dispatching");
        match route.invoke(&context, name, params)? {
            Some(pending) => pending.await.map(Some),
            None => {
                debug!(alias, method = name, "Service has no such method");
                Err(ProtocolError::not_found().into())
            }
        }
    }

    async fn respond(&self, output: RpcOutput, sink: &mut dyn ResponseSink) -> Result<DispatchOutcome, BoxError> {
        match output {
            RpcOutput::Json(result) => Envelope::success(result).send(sink).await?,
            RpcOutput::Custom(response) => response.deliver(sink, 200).await?,
        }
        Ok(DispatchOutcome::Succeeded)
    }

    async fn fail(&self, error: &SharedError, sink: &mut dyn ResponseSink) -> Result<DispatchOutcome, BoxError> {
        let classification = self.classify(error.as_ref());
        let status = classification.code;
        Envelope::failure(classification).send(sink).await?;
        Ok(DispatchOutcome::Failed { status })
    }

    /// The dispatcher's own 400/404 first, then handlers newest first, then
    /// an [`RpcError`] in the source chain, then a generic 500.
    fn classify(&self, error: &(dyn StdError + 'static)) -> Classification {
        if let Some(ProtocolError(rejected)) = error.downcast_ref::<ProtocolError>() {
            if self.config.log_client_errors {
                debug!(code = rejected.code, error = %rejected, "Request rejected");
            }
            return Classification::from(rejected);
        }

        let handlers: Vec<Arc<dyn ErrorHandler>> = self.handlers.read().clone();
        let classified = handlers
            .iter()
            .rev()
            .find_map(|handler| handler.classify(error))
            .or_else(|| RpcError::find(error).map(Classification::from));

        match classified {
            Some(classification) => {
                if classification.code >= 500 {
                    warn!(code = classification.code, error = %error, "Request failed");
                } else if self.config.log_client_errors {
                    debug!(code = classification.code, error = %error, "Request rejected");
                }
                classification
            }
            None => {
                error!(error = %error, "Unhandled error in RPC call");
                Classification::new(500, self.config.internal_error_message.clone())
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("aliases", &self.aliases())
            .field("handlers", &self.handlers.read().len())
            .field("middleware", &self.middleware.read().len())
            .field("config", &self.config)
            .finish()
    }
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::CustomResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use siyaq_container::{Construct, Container};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    // ── Fixtures ──

    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<(u16, String, Vec<u8>)>,
    }

    impl RecordingSink {
        fn json(&self) -> Value {
            assert_eq!(self.writes.len(), 1, "expected exactly one write");
            serde_json::from_slice(&self.writes[0].2).unwrap()
        }
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn write(&mut self, status: u16, content_type: &str, body: Vec<u8>) -> Result<(), BoxError> {
            self.writes.push((status, content_type.to_string(), body));
            Ok(())
        }
    }

    struct Csv(&'static str);

    #[async_trait]
    impl CustomResponse for Csv {
        async fn deliver(self: Box<Self>, sink: &mut dyn ResponseSink, status: u16) -> Result<(), BoxError> {
            sink.write(status, "text/csv", self.0.as_bytes().to_vec()).await
        }
    }

    struct TestService;

    impl Construct<ServiceContext> for TestService {
        fn construct(_: &ServiceContext) -> Result<Self, BoxError> {
            Ok(TestService)
        }
    }

    #[async_trait]
    impl RpcService for TestService {
        fn methods(&self) -> &'static [&'static str] {
            &["method", "echo", "fail", "conflict", "explode", "export"]
        }

        async fn call(&self, method: &str, params: Value) -> Result<RpcOutput, BoxError> {
            match method {
                "method" => Ok(json!("data").into()),
                "echo" => Ok(params.into()),
                "fail" => Err("database exploded".into()),
                "conflict" => Err(RpcError::new(409, "Already exists")
                    .with_data(json!({ "id": 1 }))
                    .into()),
                "explode" => panic!("service bug"),
                "export" => Ok(RpcOutput::custom(Csv("a,b\n1,2\n"))),
                other => Err(format!("unexpected method {other}").into()),
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();
        dispatcher
    }

    async fn call(dispatcher: &Dispatcher, container: &Container, request: RpcRequest) -> (DispatchOutcome, RecordingSink) {
        let mut sink = RecordingSink::default();
        let outcome = dispatcher
            .handle(container.create_context(), request, &mut sink)
            .await
            .unwrap();
        (outcome, sink)
    }

    // ── Validation ──

    #[tokio::test]
    async fn missing_method_is_400() {
        let (outcome, sink) = call(&dispatcher(), &Container::new(), RpcRequest::default()).await;

        assert_eq!(outcome, DispatchOutcome::Failed { status: 400 });
        assert_eq!(sink.writes[0].0, 400);
        assert_eq!(
            sink.json(),
            json!({
                "code": 400,
                "result": null,
                "error": { "code": 400, "message": "\"method\" query parameter not found" },
                "version": 2,
                "backendError": true
            })
        );
    }

    #[tokio::test]
    async fn missing_params_is_400() {
        let request = RpcRequest {
            method: Some("test.method".into()),
            params: None,
        };
        let (_, sink) = call(&dispatcher(), &Container::new(), request).await;

        let body = sink.json();
        assert_eq!(body["code"], 400);
        assert_eq!(
            body["error"]["message"],
            "\"params\" not found, send an empty object in case of no parameters"
        );
    }

    #[tokio::test]
    async fn unknown_method_is_404() {
        let (outcome, sink) = call(&dispatcher(), &Container::new(), RpcRequest::new("test.notMethod", json!({}))).await;

        assert_eq!(outcome.status(), Some(404));
        let body = sink.json();
        assert_eq!(body["error"], json!({ "code": 404, "message": "Method not found" }));
        assert_eq!(body["backendError"], true);
    }

    #[tokio::test]
    async fn unknown_alias_is_404() {
        let (outcome, _) = call(&dispatcher(), &Container::new(), RpcRequest::new("tset.method", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 404 });

        let (outcome, _) = call(&dispatcher(), &Container::new(), RpcRequest::new("method", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 404 });
    }

    // ── Success ──

    #[tokio::test]
    async fn success_envelope_after_disposal() {
        let container = Container::new();
        let disposed = Arc::new(AtomicU32::new(0));
        {
            let disposed = Arc::clone(&disposed);
            container.on_dispose(move |_, error| {
                assert!(error.is_none());
                disposed.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), BoxError>(()) }
            });
        }

        let (outcome, sink) = call(&dispatcher(), &container, RpcRequest::new("test.method", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Succeeded);
        assert_eq!(sink.writes[0].1, "application/json");
        assert_eq!(
            sink.json(),
            json!({ "code": 200, "result": "data", "error": null, "version": 2 })
        );
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn params_reach_the_method() {
        let (_, sink) = call(&dispatcher(), &Container::new(), RpcRequest::new("test.echo", json!({ "a": 1 }))).await;
        assert_eq!(sink.json()["result"], json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn nested_alias_uses_last_dot() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register("admin.reports", Key::<ServiceContext, TestService>::constructor())
            .unwrap();

        let (outcome, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("admin.reports.method", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Succeeded);
        assert_eq!(sink.json()["result"], "data");
    }

    #[tokio::test]
    async fn custom_response_writes_itself() {
        let (outcome, sink) = call(&dispatcher(), &Container::new(), RpcRequest::new("test.export", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Succeeded);
        assert_eq!(sink.writes.len(), 1);
        let (status, content_type, body) = &sink.writes[0];
        assert_eq!(*status, 200);
        assert_eq!(content_type, "text/csv");
        assert_eq!(body.as_slice(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn disposal_finishes_before_the_write() {
        struct WatchingSink {
            disposed: Arc<AtomicBool>,
            disposed_at_write: Option<bool>,
        }

        #[async_trait]
        impl ResponseSink for WatchingSink {
            async fn write(&mut self, _: u16, _: &str, _: Vec<u8>) -> Result<(), BoxError> {
                self.disposed_at_write = Some(self.disposed.load(Ordering::SeqCst));
                Ok(())
            }
        }

        let container = Container::new();
        let disposed = Arc::new(AtomicBool::new(false));
        {
            let disposed = Arc::clone(&disposed);
            container.on_dispose(move |_, _| {
                let disposed = Arc::clone(&disposed);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    disposed.store(true, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }
            });
        }

        let mut sink = WatchingSink {
            disposed: Arc::clone(&disposed),
            disposed_at_write: None,
        };
        dispatcher()
            .handle(container.create_context(), RpcRequest::new("test.fail", json!({})), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.disposed_at_write, Some(true));
    }

    // ── Failures ──

    #[tokio::test]
    async fn failing_cleanup_turns_success_into_failure() {
        let container = Container::new();
        container.on_dispose(|_, _| async { Err::<(), BoxError>("commit failed".into()) });

        let (outcome, sink) = call(&dispatcher(), &container, RpcRequest::new("test.method", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Failed { status: 500 });
        assert_eq!(sink.json()["error"]["message"], "Internal server error");
    }

    #[tokio::test]
    async fn listeners_receive_the_request_error() {
        let container = Container::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            container.on_dispose(move |_, error| {
                seen.lock().push(error.map(|e| e.to_string()));
                async { Ok::<(), BoxError>(()) }
            });
        }

        call(&dispatcher(), &container, RpcRequest::new("test.fail", json!({}))).await;
        assert_eq!(*seen.lock(), vec![Some("database exploded".to_string())]);
    }

    #[tokio::test]
    async fn unclassified_errors_do_not_leak() {
        let (outcome, sink) = call(&dispatcher(), &Container::new(), RpcRequest::new("test.fail", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Failed { status: 500 });
        let body = sink.json();
        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(!body.to_string().contains("database exploded"));
    }

    #[tokio::test]
    async fn internal_message_is_configurable() {
        let dispatcher = Dispatcher::builder()
            .config(DispatcherConfig {
                internal_error_message: "Something went wrong".into(),
                ..DispatcherConfig::default()
            })
            .build();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();

        let (_, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("test.fail", json!({}))).await;
        assert_eq!(sink.json()["error"]["message"], "Something went wrong");
    }

    #[tokio::test]
    async fn rpc_error_code_passes_through() {
        let (outcome, sink) = call(&dispatcher(), &Container::new(), RpcRequest::new("test.conflict", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Failed { status: 409 });
        assert_eq!(
            sink.json(),
            json!({
                "code": 409,
                "result": { "id": 1 },
                "error": { "code": 409, "message": "Already exists" },
                "version": 2,
                "backendError": true
            })
        );
    }

    #[tokio::test]
    async fn panics_are_caught_and_disposed() {
        let container = Container::new();
        let seen = Arc::new(Mutex::new(None::<String>));
        {
            let seen = Arc::clone(&seen);
            container.on_dispose(move |_, error| {
                *seen.lock() = error.map(|e| e.to_string());
                async { Ok::<(), BoxError>(()) }
            });
        }

        let (outcome, _) = call(&dispatcher(), &container, RpcRequest::new("test.explode", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Failed { status: 500 });
        assert!(seen.lock().as_deref().is_some_and(|e| e.contains("service bug")));
    }

    #[tokio::test]
    async fn failing_constructor_goes_through_failure_path() {
        struct Broken;
        #[async_trait]
        impl RpcService for Broken {
            fn methods(&self) -> &'static [&'static str] {
                &["any"]
            }
            async fn call(&self, _: &str, _: Value) -> Result<RpcOutput, BoxError> {
                Ok(Value::Null.into())
            }
        }

        let dispatcher = Dispatcher::new();
        let key = Key::<ServiceContext, Broken>::factory("broken", |_| {
            Err(RpcError::new(503, "Warming up").into())
        });
        dispatcher.register("broken", key).unwrap();

        let (outcome, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("broken.any", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 503 });
        assert_eq!(sink.json()["error"]["message"], "Warming up");
    }

    // ── Error handlers ──

    #[tokio::test]
    async fn latest_error_handler_wins_and_none_is_skipped() {
        let dispatcher = Dispatcher::builder()
            .on_error(|_| Some(Classification::new(418, "first")))
            .on_error(|_| Some(Classification::new(418, "second")))
            .on_error(|_| None)
            .build();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();

        let (outcome, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("test.fail", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Failed { status: 418 });
        assert_eq!(sink.json()["error"]["message"], "second");
    }

    #[tokio::test]
    async fn catch_all_handler_leaves_dispatch_errors_alone() {
        let dispatcher = Dispatcher::builder()
            .on_error(|_| Some(Classification::new(418, "teapot")))
            .build();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();
        let container = Container::new();

        let (outcome, sink) = call(&dispatcher, &container, RpcRequest::default()).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 400 });
        assert_eq!(sink.json()["error"]["message"], "\"method\" query parameter not found");

        let (outcome, _) = call(&dispatcher, &container, RpcRequest::new("test.nope", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 404 });

        let (outcome, _) = call(&dispatcher, &container, RpcRequest::new("test.fail", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 418 });
    }

    #[tokio::test]
    async fn handlers_added_later_take_priority() {
        let dispatcher = dispatcher();
        dispatcher.add_error_handler(|err: &(dyn StdError + 'static)| {
            RpcError::find(err).map(|e| Classification::new(422, format!("rejected: {}", e.message)))
        });

        let (_, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("test.conflict", json!({}))).await;
        assert_eq!(sink.json()["error"], json!({ "code": 422, "message": "rejected: Already exists" }));
    }

    // ── Registration ──

    #[test]
    fn duplicate_alias_is_rejected() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap_err();

        assert!(matches!(&err, DispatchError::DuplicateAlias { alias } if alias == "test"));
        assert!(err.to_string().contains("test"));
        assert_eq!(dispatcher.aliases(), ["test"]);
    }

    #[tokio::test]
    async fn service_is_built_once_per_request() {
        static BUILT: AtomicU32 = AtomicU32::new(0);

        struct Counted;
        #[async_trait]
        impl RpcService for Counted {
            fn methods(&self) -> &'static [&'static str] {
                &["ping"]
            }
            async fn call(&self, _: &str, _: Value) -> Result<RpcOutput, BoxError> {
                Ok(json!("pong").into())
            }
        }

        let key = Key::<ServiceContext, Counted>::factory("counted", |_| {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Counted))
        });
        let dispatcher = Dispatcher::new();
        dispatcher.register("counted", key.clone()).unwrap();

        let container = Container::new();
        let context = container.create_context();
        context.get_service(&key).unwrap();
        let mut sink = RecordingSink::default();
        dispatcher
            .handle(context.clone(), RpcRequest::new("counted.ping", json!({})), &mut sink)
            .await
            .unwrap();

        assert_eq!(BUILT.load(Ordering::SeqCst), 1);

        call(&dispatcher, &container, RpcRequest::new("counted.ping", json!({}))).await;
        assert_eq!(BUILT.load(Ordering::SeqCst), 2);
    }

    // ── Middleware ──

    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Trace {
        async fn handle(&self, call: RpcCall, next: Next<'_>) -> CallResult {
            self.log.lock().push(format!("{}>", self.name));
            let result = next.run(call).await;
            self.log.lock().push(format!("<{}", self.name));
            result
        }
    }

    #[tokio::test]
    async fn last_registered_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::builder()
            .middleware(Trace {
                name: "first",
                log: Arc::clone(&log),
            })
            .build();
        dispatcher.add_middleware(Trace {
            name: "second",
            log: Arc::clone(&log),
        });
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();

        let (outcome, _) = call(&dispatcher, &Container::new(), RpcRequest::new("test.method", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::Succeeded);
        assert_eq!(*log.lock(), ["second>", "first>", "<first", "<second"]);
    }

    #[tokio::test]
    async fn short_circuit_writes_nothing_but_disposes() {
        struct Maintenance;
        #[async_trait]
        impl Middleware for Maintenance {
            async fn handle(&self, _: RpcCall, _: Next<'_>) -> CallResult {
                Ok(None)
            }
        }

        let container = Container::new();
        let disposed = Arc::new(AtomicBool::new(false));
        {
            let disposed = Arc::clone(&disposed);
            container.on_dispose(move |_, _| {
                disposed.store(true, Ordering::SeqCst);
                async { Ok::<(), BoxError>(()) }
            });
        }
        let dispatcher = Dispatcher::builder().middleware(Maintenance).build();

        let (outcome, sink) = call(&dispatcher, &container, RpcRequest::new("test.method", json!({}))).await;

        assert_eq!(outcome, DispatchOutcome::ShortCircuited);
        assert!(sink.writes.is_empty());
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn middleware_failure_takes_the_failure_path() {
        struct RequireUser;
        #[async_trait]
        impl Middleware for RequireUser {
            async fn handle(&self, call: RpcCall, next: Next<'_>) -> CallResult {
                if call.context.get::<String>()?.is_none() {
                    return Err(RpcError::new(401, "Unauthorized").into());
                }
                next.run(call).await
            }
        }

        let dispatcher = Dispatcher::builder().middleware(RequireUser).build();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();
        let container = Container::new();

        let (outcome, _) = call(&dispatcher, &container, RpcRequest::new("test.method", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed { status: 401 });

        let context = container.create_context();
        context.insert(String::from("amina")).unwrap();
        let mut sink = RecordingSink::default();
        let outcome = dispatcher
            .handle(context, RpcRequest::new("test.method", json!({})), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Succeeded);
    }

    #[tokio::test]
    async fn middleware_can_read_the_dispatcher() {
        struct ListAliases;
        #[async_trait]
        impl Middleware for ListAliases {
            async fn handle(&self, call: RpcCall, next: Next<'_>) -> CallResult {
                if call.request.method.as_deref() == Some("meta.aliases") {
                    return Ok(Some(json!(next.dispatcher().aliases()).into()));
                }
                next.run(call).await
            }
        }

        let dispatcher = Dispatcher::builder().middleware(ListAliases).build();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();

        let (_, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("meta.aliases", json!({}))).await;
        assert_eq!(sink.json()["result"], json!(["test"]));
    }

    #[tokio::test]
    async fn middleware_can_rewrite_results() {
        struct Wrap;
        #[async_trait]
        impl Middleware for Wrap {
            async fn handle(&self, call: RpcCall, next: Next<'_>) -> CallResult {
                match next.run(call).await? {
                    Some(RpcOutput::Json(value)) => Ok(Some(json!({ "wrapped": value }).into())),
                    other => Ok(other),
                }
            }
        }

        let dispatcher = Dispatcher::builder().middleware(Wrap).build();
        dispatcher
            .register("test", Key::<ServiceContext, TestService>::constructor())
            .unwrap();

        let (_, sink) = call(&dispatcher, &Container::new(), RpcRequest::new("test.method", json!({}))).await;
        assert_eq!(sink.json()["result"], json!({ "wrapped": "data" }));
    }
}
