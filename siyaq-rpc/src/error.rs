//! Error types for the RPC layer.
//!
//! [`RpcError`] is the request-visible error: a service returns one (or
//! wraps one anywhere in its source chain) to pick the response status.
//! [`DispatchError`] covers configuration mistakes made at startup.

use std::error::Error as StdError;

use serde_json::Value;

pub use siyaq_container::BoxError;

pub(crate) const MISSING_METHOD: &str = "\"method\" query parameter not found";
pub(crate) const MISSING_PARAMS: &str = "\"params\" not found, send an empty object in case of no parameters";
pub(crate) const METHOD_NOT_FOUND: &str = "Method not found";

/// An error carrying the HTTP status it should be answered with.
///
/// ```
/// use siyaq_rpc::RpcError;
/// use serde_json::json;
///
/// let err = RpcError::new(409, "Order already paid").with_data(json!({ "order": 7 }));
/// assert_eq!(err.code, 409);
/// assert_eq!(err.to_string(), "Order already paid");
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub code: u16,
    pub message: String,
    /// Sent back as the envelope's `result`.
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn not_found() -> Self {
        Self::new(404, METHOD_NOT_FOUND)
    }

    /// The first `RpcError` in `error`'s source chain, `error` included.
    pub fn find<'a>(error: &'a (dyn StdError + 'static)) -> Option<&'a RpcError> {
        std::iter::successors(Some(error), |e| (*e).source()).find_map(|e| e.downcast_ref::<RpcError>())
    }
}

/// A malformed or unroutable request, rejected by the dispatcher itself.
///
/// Answered with its own status before any error handler runs.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub(crate) struct ProtocolError(pub(crate) RpcError);

impl ProtocolError {
    pub(crate) fn bad_request(message: &str) -> Self {
        Self(RpcError::bad_request(message))
    }

    pub(crate) fn not_found() -> Self {
        Self(RpcError::not_found())
    }
}

/// How a failed request is answered. Produced by error handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub code: u16,
    pub message: String,
    pub data: Option<Value>,
}

impl Classification {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&RpcError> for Classification {
    fn from(err: &RpcError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            data: err.data.clone(),
        }
    }
}

/// Dispatcher configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Service alias \"{alias}\" is already registered\n  Hint: every service needs its own alias")]
    DuplicateAlias { alias: String },
}
