//! Incoming RPC requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the transport extracted from the wire.
///
/// `params` must be present, even for methods without parameters; an empty
/// object is the way to say "no parameters". JSON `null` counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
        }
    }
}

/// Splits `"alias.method"` at the last dot.
///
/// ```
/// use siyaq_rpc::request::split_method;
///
/// assert_eq!(split_method("orders.create"), Some(("orders", "create")));
/// assert_eq!(split_method("path.with.more.dots"), Some(("path.with.more", "dots")));
/// assert_eq!(split_method("nodot"), None);
/// ```
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    method.rsplit_once('.')
}
