//! JSON-RPC 2.0 envelopes exchanged with the worker.
//!
//! # Wire Format
//!
//! Requests and responses are single-line JSON objects terminated by `\n`:
//!
//! ```text
//! {"jsonrpc":"2.0","id":"req_1","method":"echo","params":{"x":1}}
//! {"jsonrpc":"2.0","id":"req_1","result":{"x":1}}
//! {"jsonrpc":"2.0","id":"req_2","error":{"code":-32601,"message":"Method not found: nope"}}
//! ```
//!
//! The `jsonrpc` field on responses is accepted but not required.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Protocol version tag carried by every request.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Reserved method asking the worker to terminate gracefully.
pub const SHUTDOWN_METHOD: &str = "shutdown";

/// Reserved health-check method.
pub const PING_METHOD: &str = "ping";

/// Correlation identifier, rendered as `req_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Build the identifier for the `n`th request of a bridge instance.
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("req_{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound response envelope.
///
/// `id` is optional because a worker answers unparseable input with a
/// null id; such responses cannot be correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    /// `Some(Value::Null)` for `"result": null`, `None` when absent.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Successful response for `id`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Some(PROTOCOL_VERSION.to_string()),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error response for `id`.
    pub fn failure(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Some(PROTOCOL_VERSION.to_string()),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Convert into the caller-facing outcome.
    ///
    /// An error object wins over a result. A response with neither is a
    /// `null` result.
    pub fn into_outcome(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A field that is present, even as `null`, deserializes to `Some`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Encode a request as one newline-terminated frame.
///
/// `serde_json` escapes control characters inside strings, so the only
/// raw `\n` in the output is the terminator.
pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>, BridgeError> {
    let mut buf = serde_json::to_vec(request)
        .map_err(|e| BridgeError::Protocol(format!("Failed to serialize request: {e}")))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Encode a response as one newline-terminated frame (worker side).
pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>, BridgeError> {
    let mut buf = serde_json::to_vec(response)
        .map_err(|e| BridgeError::Protocol(format!("Failed to serialize response: {e}")))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one frame into a response envelope.
pub fn decode_response(frame: &str) -> Result<RpcResponse, BridgeError> {
    serde_json::from_str(frame)
        .map_err(|e| BridgeError::Protocol(format!("Failed to parse response: {e}")))
}
