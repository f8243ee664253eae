//! Request / response payloads for tool calls, resources, and server metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of a tool call, keyed by parameter name.
pub type ToolParameters = serde_json::Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Tool calls
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub parameters: ToolParameters,
}

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Any additional attributes the server attached to the block.
    #[serde(flatten)]
    pub attributes: HashMap<String, Value>,
}

impl ContentItem {
    pub const TEXT: &str = "text";
    pub const ERROR: &str = "error";

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: Self::TEXT.into(),
            text: Some(text.into()),
            attributes: HashMap::new(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content_type: Self::ERROR.into(),
            text: Some(text.into()),
            attributes: HashMap::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.content_type == Self::ERROR
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl ToolCallResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            metadata: None,
        }
    }

    /// The first content block flagged as an error, if any.
    pub fn error_item(&self) -> Option<&ContentItem> {
        self.content.iter().find(|item| item.is_error())
    }

    /// All text blocks joined by newlines.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|item| item.content_type == ContentItem::TEXT)
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resources
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResponse {
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server metadata
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the tool parameters.
    #[serde(default)]
    pub parameters_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

impl ServerInfo {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}
