//! JSON-RPC 2.0 envelope used by the WebSocket transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// JSON-RPC 2.0 request ID, either a string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A message received from the server, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Validate that this is a well-formed JSON-RPC 2.0 request.
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == "2.0" && !self.method.is_empty()
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl JsonRpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a taxonomy code so clients can classify the failure exactly.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.data = Some(serde_json::json!({ "code": code.as_str() }));
        self
    }

    /// The taxonomy code carried in `data.code`, if any.
    pub fn data_code(&self) -> Option<&str> {
        self.data.as_ref()?.get("code")?.as_str()
    }

    /// Classify this error. `data.code` wins; otherwise the numeric code is
    /// mapped (-32000..-32099 being implementation-defined server errors).
    pub fn classify(&self) -> Option<ErrorCode> {
        if let Some(code) = self.data_code().and_then(ErrorCode::from_wire) {
            return Some(code);
        }
        match self.code {
            Self::PARSE_ERROR | Self::INVALID_REQUEST | Self::INVALID_PARAMS => {
                Some(ErrorCode::ValidationError)
            }
            Self::METHOD_NOT_FOUND => Some(ErrorCode::ResourceNotFound),
            Self::INTERNAL_ERROR | -32099..=-32000 => Some(ErrorCode::ServerError),
            _ => None,
        }
    }
}

impl IncomingMessage {
    /// Classify a raw JSON message. Returns `None` if it is neither a
    /// response nor a notification.
    pub fn classify(value: Value) -> Option<Self> {
        if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return None;
        }
        let has_method = value.get("method").and_then(Value::as_str).is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        if has_method && !has_id {
            return serde_json::from_value(value).ok().map(Self::Notification);
        }
        if value.get("result").is_some() || value.get("error").is_some() {
            return serde_json::from_value(value).ok().map(Self::Response);
        }
        None
    }
}
