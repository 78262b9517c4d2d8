//! Outgoing JSON-RPC messages written by the connection core.

use kiln_types::RequestId;
use serde::Serialize;

/// Standard JSON-RPC and LSP-family error codes.
pub mod codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct Response {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        // Serializing this struct cannot fail: every field is a plain JSON value.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
