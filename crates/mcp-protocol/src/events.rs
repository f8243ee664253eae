//! Server-initiated push events.
//!
//! Transports deliver these as JSON strings tagged with an [`EventCategory`];
//! [`McpEvent::parse`] is the single place where they become typed values.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::ToolParameters;

/// The four push-event categories a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventCategory {
    ConnectionState,
    ToolCall,
    ResourceRequest,
    Error,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        Self::ConnectionState,
        Self::ToolCall,
        Self::ResourceRequest,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionState => "connectionState",
            Self::ToolCall => "toolCall",
            Self::ResourceRequest => "resourceRequest",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateEvent {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: ToolParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequestEvent {
    pub request_id: String,
    pub uri: String,
}

/// Out-of-band error. The code is free-form: native layers send codes such as
/// `connection_lost` that are signals rather than taxonomy members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
}

impl ErrorEvent {
    /// Code sent by the transport when an established link drops.
    pub const CONNECTION_LOST: &str = "connection_lost";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(Self::CONNECTION_LOST, message)
    }

    pub fn is_connection_lost(&self) -> bool {
        self.code == Self::CONNECTION_LOST
    }
}

impl From<ProtocolError> for ErrorEvent {
    fn from(err: ProtocolError) -> Self {
        Self::new(err.code.as_str(), err.message)
    }
}

/// A typed push event.
#[derive(Debug, Clone, PartialEq)]
pub enum McpEvent {
    ConnectionState(ConnectionStateEvent),
    ToolCall(ToolCallEvent),
    ResourceRequest(ResourceRequestEvent),
    Error(ErrorEvent),
}

impl McpEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::ConnectionState(_) => EventCategory::ConnectionState,
            Self::ToolCall(_) => EventCategory::ToolCall,
            Self::ResourceRequest(_) => EventCategory::ResourceRequest,
            Self::Error(_) => EventCategory::Error,
        }
    }

    /// Parse the JSON payload of a push event of the given category.
    pub fn parse(category: EventCategory, payload: &str) -> Result<Self, ProtocolError> {
        let malformed = |e: serde_json::Error| {
            ProtocolError::malformed(&format!("{} event", category.as_str()), e)
        };
        let event = match category {
            EventCategory::ConnectionState => {
                Self::ConnectionState(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventCategory::ToolCall => Self::ToolCall(serde_json::from_str(payload).map_err(malformed)?),
            EventCategory::ResourceRequest => {
                Self::ResourceRequest(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventCategory::Error => Self::Error(serde_json::from_str(payload).map_err(malformed)?),
        };
        Ok(event)
    }

    /// Serialize the payload part of this event.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::ConnectionState(e) => serde_json::to_string(e),
            Self::ToolCall(e) => serde_json::to_string(e),
            Self::ResourceRequest(e) => serde_json::to_string(e),
            Self::Error(e) => serde_json::to_string(e),
        }
    }
}
