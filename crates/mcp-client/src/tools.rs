//! Typed helpers for the assistant tools a voice MCP server exposes.

use mcp_protocol::{ProtocolError, ToolCallResponse, ToolParameters};
use mcp_transport::McpTransport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::RpcLayer;

pub const CREATE_CALENDAR_EVENT: &str = "createCalendarEvent";
pub const CREATE_REMINDER: &str = "createReminder";
pub const CREATE_NOTE: &str = "createNote";
pub const PROCESS_USER_INPUT: &str = "processUserInput";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub title: String,
    /// ISO-8601 timestamp
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderItem {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

/// Borrowing view over an [`RpcLayer`]. All calls retry.
pub struct ToolHelpers<'a, T: McpTransport> {
    rpc: &'a RpcLayer<T>,
}

impl<'a, T: McpTransport> ToolHelpers<'a, T> {
    pub fn new(rpc: &'a RpcLayer<T>) -> Self {
        Self { rpc }
    }

    pub async fn create_calendar_event(&self, event: &CalendarEvent) -> Result<ToolCallResponse, ProtocolError> {
        self.call(CREATE_CALENDAR_EVENT, event).await
    }

    pub async fn create_reminder(&self, reminder: &ReminderItem) -> Result<ToolCallResponse, ProtocolError> {
        self.call(CREATE_REMINDER, reminder).await
    }

    pub async fn create_note(&self, note: &Note) -> Result<ToolCallResponse, ProtocolError> {
        self.call(CREATE_NOTE, note).await
    }

    /// Let the server classify free text and act on it.
    pub async fn process_user_input(&self, text: &str) -> Result<ToolCallResponse, ProtocolError> {
        let mut params = ToolParameters::new();
        params.insert("text".into(), Value::String(text.to_string()));
        self.rpc.call_tool(PROCESS_USER_INPUT, &params, true).await
    }

    async fn call<P: Serialize>(&self, tool: &str, payload: &P) -> Result<ToolCallResponse, ProtocolError> {
        let params = to_parameters(payload)?;
        self.rpc.call_tool(tool, &params, true).await
    }
}

fn to_parameters<P: Serialize>(payload: &P) -> Result<ToolParameters, ProtocolError> {
    match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProtocolError::malformed("tool parameters", format!("expected an object, got {other}"))),
        Err(e) => Err(ProtocolError::malformed("tool parameters", e)),
    }
}
