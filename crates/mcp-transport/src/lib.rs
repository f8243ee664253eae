//! MCP Transport Layer
//!
//! Defines the boundary between the client core and the outside world:
//! - `McpTransport`: connection lifecycle, tool/resource RPC, push events
//! - `TranscriptionBackend`: speech sessions and their event streams
//! - `TransportError`: native failures, normalized by the client
//!
//! The production implementation is `WsTransport` (JSON-RPC over WebSocket,
//! Server-Sent Events for transcription streams).

pub mod boundary;
pub mod error;
pub mod sse;
pub mod ws;

pub use boundary::{McpTransport, PushStream, RawPushEvent, TranscriptionBackend, PUSH_CHANNEL_CAPACITY};
pub use error::TransportError;
pub use ws::{WsTransport, WsTransportConfig};
