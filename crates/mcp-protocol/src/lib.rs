//! MCP client protocol types.
//!
//! Single source of truth for the data that crosses the client boundary:
//! the error taxonomy, tool/resource payloads, push events, transcription
//! stream events, and the JSON-RPC 2.0 envelope used on the wire.

pub mod error;
pub mod events;
pub mod jsonrpc;
pub mod methods;
pub mod notifications;
pub mod transcription;
pub mod types;

pub use error::{ErrorCode, ProtocolError, WireError};
pub use events::{
    ConnectionStateEvent, ErrorEvent, EventCategory, McpEvent, ResourceRequestEvent,
    ToolCallEvent,
};
pub use jsonrpc::{
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};
pub use methods::{MethodName, Methods};
pub use notifications::{NotificationName, Notifications};
pub use transcription::{
    AudioConfig, ChunkReceipt, EndSpeechResult, SpeechSessionInfo, StreamFrame,
    TranscriptionEvent,
};
pub use types::{
    ContentItem, ResourceContent, ResourceRequest, ResourceResponse, ServerInfo,
    ToolCallRequest, ToolCallResponse, ToolDescriptor, ToolParameters,
};
