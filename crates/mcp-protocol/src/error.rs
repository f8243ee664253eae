//! MCP client error taxonomy.
//!
//! Every failure that reaches a caller is a [`ProtocolError`] carrying one of
//! the stable [`ErrorCode`]s below, so callers can branch on the code instead
//! of matching on server text.

use serde::{Deserialize, Serialize};

/// Stable error codes. Serialized as their snake_case wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client lifecycle
    NotConnected,
    ConnectionFailed,
    DisconnectFailed,
    InitializationFailed,

    // Operation defaults
    ToolCallFailed,
    ResourceRequestFailed,
    InputHandlingFailed,
    TranscriptionFailed,

    // Transport / server classification
    NetworkError,
    TimeoutError,
    ServerError,
    AuthenticationError,
    ValidationError,
    ResourceNotFound,
    RateLimitExceeded,

    // Boundary checks
    MalformedPayload,
    SessionNotActive,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 17] = [
        Self::NotConnected,
        Self::ConnectionFailed,
        Self::DisconnectFailed,
        Self::InitializationFailed,
        Self::ToolCallFailed,
        Self::ResourceRequestFailed,
        Self::InputHandlingFailed,
        Self::TranscriptionFailed,
        Self::NetworkError,
        Self::TimeoutError,
        Self::ServerError,
        Self::AuthenticationError,
        Self::ValidationError,
        Self::ResourceNotFound,
        Self::RateLimitExceeded,
        Self::MalformedPayload,
        Self::SessionNotActive,
    ];

    /// Wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::ConnectionFailed => "connection_failed",
            Self::DisconnectFailed => "disconnect_failed",
            Self::InitializationFailed => "initialization_failed",
            Self::ToolCallFailed => "tool_call_failed",
            Self::ResourceRequestFailed => "resource_request_failed",
            Self::InputHandlingFailed => "input_handling_failed",
            Self::TranscriptionFailed => "transcription_failed",
            Self::NetworkError => "network_error",
            Self::TimeoutError => "timeout_error",
            Self::ServerError => "server_error",
            Self::AuthenticationError => "authentication_error",
            Self::ValidationError => "validation_error",
            Self::ResourceNotFound => "resource_not_found",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::MalformedPayload => "malformed_payload",
            Self::SessionNotActive => "session_not_active",
        }
    }

    /// Classify a code string received from a server or native layer.
    ///
    /// Accepts the snake_case names as well as bare HTTP-style status codes
    /// (`"503"`, `"401"`, ...). Returns `None` for anything unrecognised.
    pub fn from_wire(code: &str) -> Option<Self> {
        let code = code.trim();
        if let Some(known) = Self::ALL.iter().find(|c| c.as_str() == code) {
            return Some(*known);
        }

        let status: u16 = code.parse().ok()?;
        Self::from_status(status)
    }

    /// Map an HTTP-style status to a code. Only error statuses classify.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400 | 422 => Some(Self::ValidationError),
            401 | 403 => Some(Self::AuthenticationError),
            404 => Some(Self::ResourceNotFound),
            408 => Some(Self::TimeoutError),
            429 => Some(Self::RateLimitExceeded),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }

    /// Whether a failure with this code is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError | Self::TimeoutError | Self::ServerError)
    }

    /// Fallback message used when a failure arrives without text.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::NotConnected => "MCP client is not connected to a server",
            Self::ConnectionFailed => "Failed to connect to the MCP server",
            Self::DisconnectFailed => "Failed to disconnect from the MCP server",
            Self::InitializationFailed => "Failed to initialize the MCP client",
            Self::ToolCallFailed => "Tool call failed",
            Self::ResourceRequestFailed => "Resource request failed",
            Self::InputHandlingFailed => "Failed to handle MCP input",
            Self::TranscriptionFailed => "Transcription failed",
            Self::NetworkError => "Network connection interrupted",
            Self::TimeoutError => "Request timed out",
            Self::ServerError => "Internal server error",
            Self::AuthenticationError => "Authentication failed",
            Self::ValidationError => "Request validation failed",
            Self::ResourceNotFound => "Requested resource does not exist",
            Self::RateLimitExceeded => "Rate limit exceeded",
            Self::MalformedPayload => "Malformed payload",
            Self::SessionNotActive => "Transcription session is not active",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed client-side failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    /// Build an error; an empty message is replaced by the code's default.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            code.default_message().to_string()
        } else {
            message
        };
        Self { code, message }
    }

    /// Build an error from a wire `{code, message}` pair, falling back to
    /// `fallback` when the code is not part of the taxonomy.
    pub fn from_wire(code: &str, message: impl Into<String>, fallback: ErrorCode) -> Self {
        Self::new(ErrorCode::from_wire(code).unwrap_or(fallback), message)
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "")
    }

    pub fn malformed(what: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::MalformedPayload, format!("Malformed {what}: {detail}"))
    }

    pub fn session_not_active(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotActive,
            format!("Transcription session {session_id} does not exist or is no longer active"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// A `{code, message}` pair as it appears on the wire, with a free-form code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn into_protocol_error(self, fallback: ErrorCode) -> ProtocolError {
        ProtocolError::from_wire(&self.code, self.message, fallback)
    }
}

impl From<ProtocolError> for WireError {
    fn from(err: ProtocolError) -> Self {
        Self::new(err.code.as_str(), err.message)
    }
}
