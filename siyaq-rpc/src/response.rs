//! Response envelopes and the transport boundary.
//!
//! Every answer is written through a [`ResponseSink`]. By default the
//! dispatcher writes a JSON [`Envelope`]:
//!
//! ```text
//! success  { "code": 200, "result": …,        "error": null,              "version": 2 }
//! failure  { "code": N,   "result": data|null, "error": { code, message }, "version": 2, "backendError": true }
//! ```
//!
//! A method may instead return [`RpcOutput::Custom`] to write the response
//! itself (file downloads, error-shaped payloads that are not failures).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BoxError, Classification};

pub const ENVELOPE_VERSION: u8 = 2;
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Where responses go. Implemented by the HTTP layer.
#[async_trait]
pub trait ResponseSink: Send {
    async fn write(&mut self, status: u16, content_type: &str, body: Vec<u8>) -> Result<(), BoxError>;
}

/// A result that knows how to send itself.
#[async_trait]
pub trait CustomResponse: Send {
    async fn deliver(self: Box<Self>, sink: &mut dyn ResponseSink, status: u16) -> Result<(), BoxError>;
}

/// What a service method produced.
pub enum RpcOutput {
    Json(Value),
    Custom(Box<dyn CustomResponse>),
}

impl RpcOutput {
    /// Serializes `value` into a JSON result.
    pub fn json<T: Serialize>(value: T) -> Result<Self, BoxError> {
        Ok(RpcOutput::Json(serde_json::to_value(value)?))
    }

    pub fn custom(response: impl CustomResponse + 'static) -> Self {
        RpcOutput::Custom(Box::new(response))
    }
}

impl From<Value> for RpcOutput {
    fn from(value: Value) -> Self {
        RpcOutput::Json(value)
    }
}

impl fmt::Debug for RpcOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcOutput::Json(value) => f.debug_tuple("Json").field(value).finish(),
            RpcOutput::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// The `error` member of a failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// The JSON document written for every non-custom response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: u16,
    pub result: Value,
    pub error: Option<ErrorBody>,
    pub version: u8,
    #[serde(rename = "backendError", default, skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<bool>,
}

impl Envelope {
    pub fn success(result: Value) -> Self {
        Self {
            code: 200,
            result,
            error: None,
            version: ENVELOPE_VERSION,
            backend_error: None,
        }
    }

    pub fn failure(classification: Classification) -> Self {
        Self {
            code: classification.code,
            result: classification.data.unwrap_or(Value::Null),
            error: Some(ErrorBody {
                code: classification.code,
                message: classification.message,
            }),
            version: ENVELOPE_VERSION,
            backend_error: Some(true),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Writes this envelope as JSON with its own code as the status.
    pub async fn send(&self, sink: &mut dyn ResponseSink) -> Result<(), BoxError> {
        sink.write(self.code, JSON_CONTENT_TYPE, self.to_vec()?).await
    }
}
